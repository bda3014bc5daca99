use crate::bytecode::{Register, Width};

/// One untyped 8-byte register or stack value.
///
/// No type is stored. Each instruction picks the view it needs (`as_i64`, `as_f32`, ...) at the
/// point of use, so the same bits can be read as an address by one instruction and as a double by
/// the next.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Slot(u64);

impl Slot {
    pub const ZERO: Slot = Slot(0);

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub fn from_bool(value: bool) -> Self {
        Self(value as u64)
    }

    /// The f32 occupies the low 32 bits; the high half is cleared.
    pub fn from_f32(value: f32) -> Self {
        Self(value.to_bits() as u64)
    }

    pub fn from_f64(value: f64) -> Self {
        Self(value.to_bits())
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn as_i32(self) -> i32 {
        self.0 as i32
    }

    pub fn as_u32(self) -> u32 {
        self.0 as u32
    }

    pub fn as_bool(self) -> bool {
        self.0 != 0
    }

    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    /// Arena address view.
    pub fn as_address(self) -> u64 {
        self.0
    }

    pub fn signed(self, width: Width) -> i64 {
        width.sign_extend(self.0)
    }

    pub fn unsigned(self, width: Width) -> u64 {
        width.truncate(self.0)
    }

    pub fn float(self, width: Width) -> f64 {
        match width {
            Width::Long => self.as_f32() as f64,
            _ => self.as_f64(),
        }
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Slot({:#018x})", self.0)
    }
}

impl From<i64> for Slot {
    fn from(value: i64) -> Self {
        Slot::from_i64(value)
    }
}

impl From<u64> for Slot {
    fn from(value: u64) -> Self {
        Slot::from_u64(value)
    }
}

impl From<f64> for Slot {
    fn from(value: f64) -> Self {
        Slot::from_f64(value)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterFile {
    slots: [Slot; Register::COUNT],
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, register: Register) -> Slot {
        self.slots[register as usize]
    }

    pub fn set(&mut self, register: Register, value: Slot) {
        self.slots[register as usize] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Register, Slot)> + '_ {
        Register::ALL.iter().map(|register| (*register, self.get(*register)))
    }

    pub fn clear(&mut self) {
        self.slots = [Slot::ZERO; Register::COUNT];
    }

    pub(crate) fn sp(&self) -> u64 {
        self.get(Register::Rsp).as_address()
    }

    pub(crate) fn set_sp(&mut self, value: u64) {
        self.set(Register::Rsp, Slot::from_u64(value));
    }

    pub(crate) fn bp(&self) -> u64 {
        self.get(Register::Rbp).as_address()
    }

    pub(crate) fn set_bp(&mut self, value: u64) {
        self.set(Register::Rbp, Slot::from_u64(value));
    }

    pub(crate) fn ip(&self) -> u64 {
        self.get(Register::Rip).as_address()
    }

    pub(crate) fn set_ip(&mut self, value: u64) {
        self.set(Register::Rip, Slot::from_u64(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_views_reinterpret_the_same_bits() {
        let slot = Slot::from_i64(-1);
        assert_eq!(slot.as_u64(), u64::MAX);
        assert_eq!(slot.unsigned(Width::Byte), 0xFF);
        assert_eq!(slot.signed(Width::Half), -1);

        let float = Slot::from_f32(1.5);
        assert_eq!(float.bits() >> 32, 0);
        assert_eq!(float.float(Width::Long), 1.5);
        assert_eq!(Slot::from_f64(-2.25).float(Width::Word), -2.25);
    }

    #[test]
    fn register_file_starts_zeroed() {
        let mut registers = RegisterFile::new();
        assert!(registers.iter().all(|(_, slot)| slot == Slot::ZERO));
        registers.set(Register::Rc, Slot::from_i64(9));
        registers.set_sp(16);
        assert_eq!(registers.get(Register::Rc).as_i64(), 9);
        assert_eq!(registers.get(Register::Rsp).as_u64(), 16);
        registers.clear();
        assert_eq!(registers, RegisterFile::new());
    }
}
