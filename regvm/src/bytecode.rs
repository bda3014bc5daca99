//! Instruction set and operand encoding shared by the assembler, the engine and the disassembler.

pub const MODE_IMMEDIATE: u8 = 0x01;
pub const MODE_REGISTER: u8 = 0x02;
pub const MODE_INDIRECT: u8 = 0x04;
pub const MODE_SOURCE_MASK: u8 = MODE_IMMEDIATE | MODE_REGISTER | MODE_INDIRECT;

pub const MODE_BYTE: u8 = 0x10;
pub const MODE_HALF: u8 = 0x20;
pub const MODE_LONG: u8 = 0x40;
pub const MODE_WORD: u8 = 0x80;
pub const MODE_WIDTH_MASK: u8 = MODE_BYTE | MODE_HALF | MODE_LONG | MODE_WORD;

pub const IMMEDIATE_LEN: usize = 8;
pub const DISPLACEMENT_LEN: usize = 4;
pub const ARGC_LEN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Register {
    Ra = 0,
    Rb = 1,
    Rc = 2,
    Rd = 3,
    Re = 4,
    Rf = 5,
    Rg = 6,
    Rh = 7,
    Ri = 8,
    Rj = 9,
    Rk = 10,
    Rsp = 11,
    Rbp = 12,
    Rip = 13,
}

impl Register {
    pub const COUNT: usize = 14;

    pub const ALL: [Register; Register::COUNT] = [
        Register::Ra,
        Register::Rb,
        Register::Rc,
        Register::Rd,
        Register::Re,
        Register::Rf,
        Register::Rg,
        Register::Rh,
        Register::Ri,
        Register::Rj,
        Register::Rk,
        Register::Rsp,
        Register::Rbp,
        Register::Rip,
    ];

    /// General accumulator; integer results and native return values land here.
    pub const ACCUMULATOR: Register = Register::Ra;
    /// Floating point accumulator.
    pub const FLOAT_ACCUMULATOR: Register = Register::Rf;

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Register::Ra => "ra",
            Register::Rb => "rb",
            Register::Rc => "rc",
            Register::Rd => "rd",
            Register::Re => "re",
            Register::Rf => "rf",
            Register::Rg => "rg",
            Register::Rh => "rh",
            Register::Ri => "ri",
            Register::Rj => "rj",
            Register::Rk => "rk",
            Register::Rsp => "rsp",
            Register::Rbp => "rbp",
            Register::Rip => "rip",
        }
    }

    /// Registers nameable from assembly. `rip` only moves through jumps, calls and returns.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ra" => Some(Register::Ra),
            "rb" => Some(Register::Rb),
            "rc" => Some(Register::Rc),
            "rd" => Some(Register::Rd),
            "re" => Some(Register::Re),
            "rf" => Some(Register::Rf),
            "rg" => Some(Register::Rg),
            "rh" => Some(Register::Rh),
            "ri" => Some(Register::Ri),
            "rj" => Some(Register::Rj),
            "rk" => Some(Register::Rk),
            "rsp" => Some(Register::Rsp),
            "rbp" => Some(Register::Rbp),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Width {
    Byte = 1,
    Half = 2,
    Long = 4,
    Word = 8,
}

impl Width {
    pub fn bytes(self) -> usize {
        self as usize
    }

    pub fn bits(self) -> u32 {
        self as u32 * 8
    }

    pub fn mode_bits(self) -> u8 {
        match self {
            Width::Byte => MODE_BYTE,
            Width::Half => MODE_HALF,
            Width::Long => MODE_LONG,
            Width::Word => MODE_WORD,
        }
    }

    pub fn from_mode(mode: u8) -> Option<Self> {
        match mode & MODE_WIDTH_MASK {
            MODE_BYTE => Some(Width::Byte),
            MODE_HALF => Some(Width::Half),
            MODE_LONG => Some(Width::Long),
            MODE_WORD => Some(Width::Word),
            _ => None,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Width::Byte => "byte",
            Width::Half => "half",
            Width::Long => "long",
            Width::Word => "word",
        }
    }

    pub fn parse_keyword(word: &str) -> Option<Self> {
        match word {
            "byte" => Some(Width::Byte),
            "half" => Some(Width::Half),
            "long" => Some(Width::Long),
            "word" => Some(Width::Word),
            _ => None,
        }
    }

    /// Keeps the low `self` bytes of `raw`.
    pub fn truncate(self, raw: u64) -> u64 {
        match self {
            Width::Word => raw,
            other => raw & ((1u64 << other.bits()) - 1),
        }
    }

    /// Sign-extends the low `self` bytes of `raw` to 64 bits.
    pub fn sign_extend(self, raw: u64) -> i64 {
        let shift = 64 - self.bits();
        ((raw << shift) as i64) >> shift
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Immediate(i64),
    Register(Register),
    Indirect { base: Register, displacement: i32 },
}

impl Operand {
    pub fn mode_source(&self) -> u8 {
        match self {
            Operand::Immediate(_) => MODE_IMMEDIATE,
            Operand::Register(_) => MODE_REGISTER,
            Operand::Indirect { .. } => MODE_INDIRECT,
        }
    }

    /// Mode byte plus payload.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Operand::Immediate(_) => IMMEDIATE_LEN,
            Operand::Register(_) => 1,
            Operand::Indirect { .. } => 1 + DISPLACEMENT_LEN,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Operand::Indirect { .. })
    }

    pub fn encode(&self, width: Width, out: &mut Vec<u8>) {
        out.push(self.mode_source() | width.mode_bits());
        match *self {
            Operand::Immediate(value) => out.extend_from_slice(&value.to_le_bytes()),
            Operand::Register(register) => out.push(register.id()),
            Operand::Indirect { base, displacement } => {
                out.push(base.id());
                out.extend_from_slice(&displacement.to_le_bytes());
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    Truncated,
    InvalidMode(u8),
    InvalidRegister(u8),
}

/// Decodes one operand at `*pos`, advancing past it.
pub fn decode_operand(code: &[u8], pos: &mut usize) -> Result<(Operand, Width), DecodeError> {
    let mode = read_u8(code, pos)?;
    let width = Width::from_mode(mode).ok_or(DecodeError::InvalidMode(mode))?;
    if mode & !(MODE_SOURCE_MASK | MODE_WIDTH_MASK) != 0 {
        return Err(DecodeError::InvalidMode(mode));
    }
    let operand = match mode & MODE_SOURCE_MASK {
        MODE_IMMEDIATE => {
            let bytes = read_array::<8>(code, pos)?;
            Operand::Immediate(i64::from_le_bytes(bytes))
        }
        MODE_REGISTER => Operand::Register(read_register(code, pos)?),
        MODE_INDIRECT => {
            let base = read_register(code, pos)?;
            let displacement = i32::from_le_bytes(read_array::<4>(code, pos)?);
            Operand::Indirect { base, displacement }
        }
        _ => return Err(DecodeError::InvalidMode(mode)),
    };
    Ok((operand, width))
}

pub fn decode_argc(code: &[u8], pos: &mut usize) -> Result<u32, DecodeError> {
    Ok(u32::from_le_bytes(read_array::<4>(code, pos)?))
}

fn read_u8(code: &[u8], pos: &mut usize) -> Result<u8, DecodeError> {
    let value = *code.get(*pos).ok_or(DecodeError::Truncated)?;
    *pos += 1;
    Ok(value)
}

fn read_register(code: &[u8], pos: &mut usize) -> Result<Register, DecodeError> {
    let id = read_u8(code, pos)?;
    Register::from_id(id).ok_or(DecodeError::InvalidRegister(id))
}

fn read_array<const N: usize>(code: &[u8], pos: &mut usize) -> Result<[u8; N], DecodeError> {
    let end = pos.checked_add(N).ok_or(DecodeError::Truncated)?;
    let bytes = code.get(*pos..end).ok_or(DecodeError::Truncated)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    *pos = end;
    Ok(out)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionForm {
    NoOperand,
    Unary,
    Binary,
    /// Target operand followed by a u32 argument count.
    Syscall,
}

macro_rules! opcodes {
    ($($variant:ident = $byte:literal, $mnemonic:literal, $form:ident;)*) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum OpCode {
            $($variant = $byte,)*
        }

        impl OpCode {
            pub const ALL: &'static [OpCode] = &[$(OpCode::$variant,)*];

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(OpCode::$variant => $mnemonic,)*
                }
            }

            pub fn parse_mnemonic(op: &str) -> Option<Self> {
                match op {
                    $($mnemonic => Some(OpCode::$variant),)*
                    _ => None,
                }
            }

            pub fn form(self) -> InstructionForm {
                match self {
                    $(OpCode::$variant => InstructionForm::$form,)*
                }
            }
        }
    };
}

opcodes! {
    Halt = 0x00, "halt", NoOperand;
    Nop = 0x01, "nop", NoOperand;
    Push = 0x02, "push", Unary;
    Pop = 0x03, "pop", Unary;
    Mov = 0x04, "mov", Binary;
    Lea = 0x05, "lea", Binary;
    Add = 0x06, "add", Binary;
    Sub = 0x07, "sub", Binary;
    Mul = 0x08, "mul", Binary;
    Div = 0x09, "div", Binary;
    Mod = 0x0A, "mod", Binary;
    UAdd = 0x0B, "uadd", Binary;
    USub = 0x0C, "usub", Binary;
    UMul = 0x0D, "umul", Binary;
    UDiv = 0x0E, "udiv", Binary;
    UMod = 0x0F, "umod", Binary;
    And = 0x10, "and", Binary;
    Or = 0x11, "or", Binary;
    Xor = 0x12, "xor", Binary;
    Shl = 0x13, "shl", Binary;
    Shr = 0x14, "shr", Binary;
    Sar = 0x15, "sar", Binary;
    Neg = 0x16, "neg", Unary;
    Inc = 0x17, "inc", Unary;
    Dec = 0x18, "dec", Unary;
    BNot = 0x19, "bnot", Unary;
    Lt = 0x1A, "lt", Binary;
    Gt = 0x1B, "gt", Binary;
    Le = 0x1C, "le", Binary;
    Ge = 0x1D, "ge", Binary;
    Ult = 0x1E, "ult", Binary;
    Ugt = 0x1F, "ugt", Binary;
    Ule = 0x20, "ule", Binary;
    Uge = 0x21, "uge", Binary;
    Cmp = 0x22, "cmp", Binary;
    Neq = 0x23, "neq", Binary;
    SetF = 0x24, "setf", Unary;
    Jmp = 0x25, "jmp", Unary;
    Jz = 0x26, "jz", Unary;
    Jnz = 0x27, "jnz", Unary;
    Call = 0x28, "call", Unary;
    Ret = 0x29, "ret", NoOperand;
    Syscall = 0x2A, "syscall", Syscall;
    FAdd = 0x2B, "fadd", Binary;
    FSub = 0x2C, "fsub", Binary;
    FMul = 0x2D, "fmul", Binary;
    FDiv = 0x2E, "fdiv", Binary;
    FNeg = 0x2F, "fneg", Unary;
    FLt = 0x30, "flt", Binary;
    FGt = 0x31, "fgt", Binary;
    FCmp = 0x32, "fcmp", Binary;
    FNeq = 0x33, "fneq", Binary;
    IToF = 0x34, "itof", Unary;
    IToD = 0x35, "itod", Unary;
    FToD = 0x36, "ftod", Unary;
    DToF = 0x37, "dtof", Unary;
    FToI = 0x38, "ftoi", Unary;
    DToI = 0x39, "dtoi", Unary;
}

impl OpCode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }

    pub fn is_jump(self) -> bool {
        matches!(self, OpCode::Jmp | OpCode::Jz | OpCode::Jnz)
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            OpCode::FAdd
                | OpCode::FSub
                | OpCode::FMul
                | OpCode::FDiv
                | OpCode::FNeg
                | OpCode::FLt
                | OpCode::FGt
                | OpCode::FCmp
                | OpCode::FNeq
        )
    }

    pub fn is_conversion(self) -> bool {
        matches!(
            self,
            OpCode::IToF | OpCode::IToD | OpCode::FToD | OpCode::DToF | OpCode::FToI | OpCode::DToI
        )
    }

    /// Comparisons only set the condition flag and never write their first operand.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            OpCode::Lt
                | OpCode::Gt
                | OpCode::Le
                | OpCode::Ge
                | OpCode::Ult
                | OpCode::Ugt
                | OpCode::Ule
                | OpCode::Uge
                | OpCode::Cmp
                | OpCode::Neq
                | OpCode::FLt
                | OpCode::FGt
                | OpCode::FCmp
                | OpCode::FNeq
        )
    }

    /// Whether the (first) operand receives a result.
    pub fn writes_destination(self) -> bool {
        match self.form() {
            InstructionForm::NoOperand | InstructionForm::Syscall => false,
            InstructionForm::Unary => !matches!(
                self,
                OpCode::Push | OpCode::Jmp | OpCode::Jz | OpCode::Jnz | OpCode::Call
            ),
            InstructionForm::Binary => !self.is_comparison(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_table_is_dense_and_round_trips() {
        for (index, opcode) in OpCode::ALL.iter().enumerate() {
            assert_eq!(*opcode as u8 as usize, index);
            assert_eq!(OpCode::from_u8(index as u8), Some(*opcode));
            assert_eq!(OpCode::parse_mnemonic(opcode.mnemonic()), Some(*opcode));
        }
        assert_eq!(OpCode::from_u8(0xFF), None);
    }

    #[test]
    fn width_extension_helpers() {
        assert_eq!(Width::Byte.truncate(0x1234), 0x34);
        assert_eq!(Width::Byte.sign_extend(0xFF), -1);
        assert_eq!(Width::Half.sign_extend(0x7FFF), 0x7FFF);
        assert_eq!(Width::Long.sign_extend(0x8000_0000), i32::MIN as i64);
        assert_eq!(Width::Word.truncate(u64::MAX), u64::MAX);
    }

    #[test]
    fn operand_encoding_matches_declared_length() {
        let operands = [
            Operand::Immediate(-7),
            Operand::Register(Register::Rc),
            Operand::Indirect {
                base: Register::Rbp,
                displacement: -24,
            },
        ];
        for operand in operands {
            let mut out = Vec::new();
            operand.encode(Width::Long, &mut out);
            assert_eq!(out.len(), operand.encoded_len());
            let mut pos = 0;
            let (decoded, width) = decode_operand(&out, &mut pos).expect("decode");
            assert_eq!(decoded, operand);
            assert_eq!(width, Width::Long);
            assert_eq!(pos, out.len());
        }
    }

    #[test]
    fn decode_rejects_bad_modes_and_registers() {
        let mut pos = 0;
        assert_eq!(
            decode_operand(&[MODE_IMMEDIATE | MODE_REGISTER | MODE_WORD], &mut pos),
            Err(DecodeError::InvalidMode(0x83))
        );
        let mut pos = 0;
        assert_eq!(
            decode_operand(&[MODE_REGISTER, 0], &mut pos),
            Err(DecodeError::InvalidMode(MODE_REGISTER))
        );
        let mut pos = 0;
        assert_eq!(
            decode_operand(&[MODE_REGISTER | MODE_WORD, 40], &mut pos),
            Err(DecodeError::InvalidRegister(40))
        );
        let mut pos = 0;
        assert_eq!(
            decode_operand(&[MODE_IMMEDIATE | MODE_WORD, 1, 2], &mut pos),
            Err(DecodeError::Truncated)
        );
    }
}
