//! RegisterBank: the simulated device's holding registers.
//!
//! Register `i` starts out holding the value `i`, which makes reads easy to
//! check by eye.

use mbgw_core::protocol::messages::ExceptionCode;

/// Number of registers a default device exposes.
pub const DEFAULT_REGISTER_COUNT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBank {
    registers: Vec<u16>,
}

impl RegisterBank {
    /// Creates `count` registers initialised to their own index.
    ///
    /// Counts above 65536 are capped: addresses are 16-bit.
    pub fn new(count: usize) -> Self {
        let count = count.min(usize::from(u16::MAX) + 1);
        Self {
            registers: (0..count).map(|i| i as u16).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// # Errors
    ///
    /// Returns [`ExceptionCode::IllegalDataAddress`] if any register in
    /// `address..address + quantity` does not exist.
    pub fn read(&self, address: u16, quantity: u16) -> Result<&[u16], ExceptionCode> {
        let range = self.range(address, quantity)?;
        Ok(&self.registers[range])
    }

    /// # Errors
    ///
    /// Returns [`ExceptionCode::IllegalDataAddress`] if the write would run
    /// past the last register.  Nothing is written in that case.
    pub fn write(&mut self, address: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        let quantity = u16::try_from(values.len()).map_err(|_| ExceptionCode::IllegalDataValue)?;
        let range = self.range(address, quantity)?;
        self.registers[range].copy_from_slice(values);
        Ok(())
    }

    fn range(&self, address: u16, quantity: u16) -> Result<std::ops::Range<usize>, ExceptionCode> {
        let start = usize::from(address);
        let end = start + usize::from(quantity);
        if end > self.registers.len() {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(start..end)
    }
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTER_COUNT)
    }
}
