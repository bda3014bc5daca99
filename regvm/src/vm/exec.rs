use tracing::trace;

use crate::bytecode::{
    DecodeError, InstructionForm, OpCode, Operand, Register, Width, decode_argc, decode_operand,
};

use super::{FunctionTarget, HOST_RETURN, Slot, Vm, VmError, VmResult};

enum Flow {
    Continue,
    Finished,
}

/// One decoded instruction. Operands are copied out so the arena is free for the execute step.
struct Instruction {
    opcode: OpCode,
    width: Width,
    first: Option<Operand>,
    second: Option<Operand>,
    argc: u32,
    next: u64,
}

impl Instruction {
    fn first(&self) -> VmResult<Operand> {
        self.first.ok_or(VmError::InvalidInstructionPointer(self.next))
    }

    fn second(&self) -> VmResult<Operand> {
        self.second.ok_or(VmError::InvalidInstructionPointer(self.next))
    }
}

fn mode_of(operand: Operand, width: Width) -> u8 {
    operand.mode_source() | width.mode_bits()
}

impl Vm {
    pub(super) fn execute(&mut self) -> VmResult<()> {
        let traced = self.image()?.debug_mode;
        loop {
            if let Some(limit) = self.config.max_instructions
                && self.instructions >= limit
            {
                return Err(VmError::InstructionLimit(limit));
            }
            let ip = self.registers.ip();
            match self.step(traced) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished) => return Ok(()),
                Err(err) => {
                    // Faults report the address of the instruction that raised them.
                    self.registers.set_ip(ip);
                    return Err(err);
                }
            }
        }
    }

    fn fetch(&self, ip: u64) -> VmResult<Instruction> {
        let image = self.image()?;
        if !image.layout.in_text(ip) {
            return Err(VmError::InvalidInstructionPointer(ip));
        }
        let code = &image.memory.as_bytes()[..image.layout.text_end()];
        let start = ip as usize;
        let byte = code[start];
        let opcode = OpCode::from_u8(byte).ok_or(VmError::UnknownOpcode {
            opcode: byte,
            address: ip,
        })?;

        let decode_error = |err: DecodeError| match err {
            DecodeError::Truncated => VmError::InvalidInstructionPointer(ip),
            DecodeError::InvalidMode(mode) => VmError::InvalidAddressingMode(mode),
            DecodeError::InvalidRegister(id) => VmError::InvalidRegister(id),
        };
        let mut pos = start + 1;
        let mut width = Width::Word;
        let mut first = None;
        let mut second = None;
        let mut argc = 0;
        match opcode.form() {
            InstructionForm::NoOperand => {}
            InstructionForm::Unary => {
                let (operand, w) = decode_operand(code, &mut pos).map_err(decode_error)?;
                first = Some(operand);
                width = w;
            }
            InstructionForm::Binary => {
                let (operand, w) = decode_operand(code, &mut pos).map_err(decode_error)?;
                first = Some(operand);
                width = w;
                second = Some(decode_operand(code, &mut pos).map_err(decode_error)?.0);
            }
            InstructionForm::Syscall => {
                let (operand, w) = decode_operand(code, &mut pos).map_err(decode_error)?;
                first = Some(operand);
                width = w;
                argc = decode_argc(code, &mut pos).map_err(decode_error)?;
            }
        }
        Ok(Instruction {
            opcode,
            width,
            first,
            second,
            argc,
            next: pos as u64,
        })
    }

    fn step(&mut self, traced: bool) -> VmResult<Flow> {
        let ip = self.registers.ip();
        let instruction = self.fetch(ip)?;
        if traced {
            trace!(
                ip,
                op = instruction.opcode.mnemonic(),
                width = instruction.width.keyword(),
                "step"
            );
        }
        self.instructions += 1;
        self.registers.set_ip(instruction.next);

        let width = instruction.width;
        match instruction.opcode {
            OpCode::Halt => return Ok(Flow::Finished),
            OpCode::Nop => {}
            OpCode::Push => {
                let value = self.read(instruction.first()?, width)?;
                self.push_raw(width, value)?;
            }
            OpCode::Pop => {
                let value = self.pop_raw(width)?;
                self.write(instruction.first()?, width, value)?;
            }
            OpCode::Mov => {
                let value = self.read(instruction.second()?, width)?;
                self.write(instruction.first()?, width, width.truncate(value))?;
            }
            OpCode::Lea => {
                let address = match instruction.second()? {
                    Operand::Indirect { base, displacement } => self.effective(base, displacement),
                    Operand::Immediate(value) => value as u64,
                    Operand::Register(register) => self.registers.get(register).as_u64(),
                };
                self.write(instruction.first()?, Width::Word, address)?;
            }
            op @ (OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Sar) => {
                let (dst, lhs, rhs) = self.binary_operands(&instruction)?;
                let (a, b) = (width.sign_extend(lhs), width.sign_extend(rhs));
                let result = match op {
                    OpCode::Add => a.wrapping_add(b),
                    OpCode::Sub => a.wrapping_sub(b),
                    OpCode::Mul => a.wrapping_mul(b),
                    OpCode::Div if b == 0 => return Err(VmError::DivisionByZero),
                    OpCode::Div => a.wrapping_div(b),
                    OpCode::Mod if b == 0 => return Err(VmError::DivisionByZero),
                    OpCode::Mod => a.wrapping_rem(b),
                    _ => a >> (b & 63),
                };
                self.write_signed(dst, width, result as u64)?;
            }
            op @ (OpCode::UAdd
            | OpCode::USub
            | OpCode::UMul
            | OpCode::UDiv
            | OpCode::UMod
            | OpCode::And
            | OpCode::Or
            | OpCode::Xor
            | OpCode::Shl
            | OpCode::Shr) => {
                let (dst, lhs, rhs) = self.binary_operands(&instruction)?;
                let (a, b) = (width.truncate(lhs), width.truncate(rhs));
                let result = match op {
                    OpCode::UAdd => a.wrapping_add(b),
                    OpCode::USub => a.wrapping_sub(b),
                    OpCode::UMul => a.wrapping_mul(b),
                    OpCode::UDiv if b == 0 => return Err(VmError::DivisionByZero),
                    OpCode::UDiv => a / b,
                    OpCode::UMod if b == 0 => return Err(VmError::DivisionByZero),
                    OpCode::UMod => a % b,
                    OpCode::And => a & b,
                    OpCode::Or => a | b,
                    OpCode::Xor => a ^ b,
                    OpCode::Shl => a << (b & 63),
                    _ => a >> (b & 63),
                };
                self.write(dst, width, width.truncate(result))?;
            }
            OpCode::Neg => {
                let dst = instruction.first()?;
                let value = width.sign_extend(self.read(dst, width)?);
                self.write_signed(dst, width, value.wrapping_neg() as u64)?;
            }
            op @ (OpCode::Inc | OpCode::Dec | OpCode::BNot) => {
                let dst = instruction.first()?;
                let value = self.read(dst, width)?;
                let result = match op {
                    OpCode::Inc => value.wrapping_add(1),
                    OpCode::Dec => value.wrapping_sub(1),
                    _ => !value,
                };
                self.write(dst, width, width.truncate(result))?;
            }
            op @ (OpCode::Lt | OpCode::Gt | OpCode::Le | OpCode::Ge) => {
                let (_, lhs, rhs) = self.binary_operands(&instruction)?;
                let (a, b) = (width.sign_extend(lhs), width.sign_extend(rhs));
                self.flag = match op {
                    OpCode::Lt => a < b,
                    OpCode::Gt => a > b,
                    OpCode::Le => a <= b,
                    _ => a >= b,
                };
            }
            op @ (OpCode::Ult
            | OpCode::Ugt
            | OpCode::Ule
            | OpCode::Uge
            | OpCode::Cmp
            | OpCode::Neq) => {
                let (_, lhs, rhs) = self.binary_operands(&instruction)?;
                let (a, b) = (width.truncate(lhs), width.truncate(rhs));
                self.flag = match op {
                    OpCode::Ult => a < b,
                    OpCode::Ugt => a > b,
                    OpCode::Ule => a <= b,
                    OpCode::Uge => a >= b,
                    OpCode::Cmp => a == b,
                    _ => a != b,
                };
            }
            OpCode::SetF => {
                let value = u64::from(self.flag);
                self.write(instruction.first()?, width, value)?;
            }
            op @ (OpCode::Jmp | OpCode::Jz | OpCode::Jnz) => {
                let displacement = self.read(instruction.first()?, Width::Word)?;
                let taken = match op {
                    OpCode::Jmp => true,
                    OpCode::Jz => self.flag,
                    _ => !self.flag,
                };
                if taken {
                    self.registers
                        .set_ip(instruction.next.wrapping_add(displacement));
                }
            }
            OpCode::Call => {
                let index = self.read(instruction.first()?, Width::Word)? as i64;
                match self.resolve_function(index)? {
                    FunctionTarget::Script { entry, .. } => {
                        self.push_raw(Width::Word, instruction.next)?;
                        self.push_raw(Width::Word, self.registers.bp())?;
                        self.registers.set_bp(self.registers.sp());
                        self.registers.set_ip(entry as u64);
                        self.call_depth += 1;
                    }
                    FunctionTarget::Native { slot } => self.call_native(index, slot, &[])?,
                }
            }
            OpCode::Ret => {
                if self.call_depth == 0 {
                    return Ok(Flow::Finished);
                }
                self.registers.set_sp(self.registers.bp());
                let bp = self.pop_raw(Width::Word)?;
                let return_address = self.pop_raw(Width::Word)?;
                self.registers.set_bp(bp);
                self.call_depth -= 1;
                if return_address == HOST_RETURN {
                    return Ok(Flow::Finished);
                }
                self.registers.set_ip(return_address);
            }
            OpCode::Syscall => {
                let index = self.read(instruction.first()?, Width::Word)? as i64;
                let slot = match self.resolve_function(index) {
                    Ok(FunctionTarget::Native { slot }) if index < 0 => slot,
                    _ => return Err(VmError::UndefinedFunction(index)),
                };
                let args = self.pop_args(instruction.argc)?;
                self.call_native(index, slot, &args)?;
            }
            op @ (OpCode::FAdd | OpCode::FSub | OpCode::FMul | OpCode::FDiv) => {
                let (dst, lhs, rhs) = self.binary_operands(&instruction)?;
                let (a, b) = (
                    float_view(lhs, width, dst)?,
                    float_view(rhs, width, dst)?,
                );
                let result = match op {
                    OpCode::FAdd => a + b,
                    OpCode::FSub => a - b,
                    OpCode::FMul => a * b,
                    _ => a / b,
                };
                self.write(dst, width, float_bits(result, width))?;
            }
            OpCode::FNeg => {
                let dst = instruction.first()?;
                let value = float_view(self.read(dst, width)?, width, dst)?;
                self.write(dst, width, float_bits(-value, width))?;
            }
            op @ (OpCode::FLt | OpCode::FGt | OpCode::FCmp | OpCode::FNeq) => {
                let (dst, lhs, rhs) = self.binary_operands(&instruction)?;
                let (a, b) = (
                    float_view(lhs, width, dst)?,
                    float_view(rhs, width, dst)?,
                );
                self.flag = match op {
                    OpCode::FLt => a < b,
                    OpCode::FGt => a > b,
                    OpCode::FCmp => a == b,
                    _ => a != b,
                };
            }
            op @ (OpCode::IToF
            | OpCode::IToD
            | OpCode::FToD
            | OpCode::DToF
            | OpCode::FToI
            | OpCode::DToI) => {
                let target = instruction.first()?;
                let slot = Slot::from_bits(self.read(target, Width::Word)?);
                let converted = match op {
                    OpCode::IToF => Slot::from_f32(slot.as_i64() as f32),
                    OpCode::IToD => Slot::from_f64(slot.as_i64() as f64),
                    OpCode::FToD => Slot::from_f64(slot.as_f32() as f64),
                    OpCode::DToF => Slot::from_f32(slot.as_f64() as f32),
                    OpCode::FToI => Slot::from_i64(slot.as_f32() as i64),
                    _ => Slot::from_i64(slot.as_f64() as i64),
                };
                self.write(target, Width::Word, converted.bits())?;
            }
        }
        Ok(Flow::Continue)
    }

    fn binary_operands(&self, instruction: &Instruction) -> VmResult<(Operand, u64, u64)> {
        let dst = instruction.first()?;
        let lhs = self.read(dst, instruction.width)?;
        let rhs = self.read(instruction.second()?, instruction.width)?;
        Ok((dst, lhs, rhs))
    }

    fn effective(&self, base: Register, displacement: i32) -> u64 {
        self.registers
            .get(base)
            .as_address()
            .wrapping_add(displacement as i64 as u64)
    }

    /// Raw operand bits. Memory reads are zero-extended from `width`.
    fn read(&self, operand: Operand, width: Width) -> VmResult<u64> {
        match operand {
            Operand::Immediate(value) => Ok(value as u64),
            Operand::Register(register) => Ok(self.registers.get(register).as_u64()),
            Operand::Indirect { base, displacement } => {
                let address = self.effective(base, displacement);
                self.image()?.memory.load(address, width)
            }
        }
    }

    /// Registers take all 64 bits of `value`; memory takes its low `width` bytes.
    fn write(&mut self, operand: Operand, width: Width, value: u64) -> VmResult<()> {
        match operand {
            Operand::Immediate(_) => Err(VmError::InvalidAddressingMode(mode_of(operand, width))),
            Operand::Register(register) => {
                self.registers.set(register, Slot::from_u64(value));
                Ok(())
            }
            Operand::Indirect { base, displacement } => {
                let address = self.effective(base, displacement);
                self.image_mut()?.memory.store(address, width, value)
            }
        }
    }

    fn write_signed(&mut self, operand: Operand, width: Width, value: u64) -> VmResult<()> {
        self.write(operand, width, width.sign_extend(value) as u64)
    }

    /// Safe mode additionally confines the stack pointer to the stack segment.
    fn stack_guard(&self, address: u64, width: Width) -> VmResult<()> {
        let image = self.image()?;
        let end = address.checked_add(width.bytes() as u64);
        if image.safe_mode && end.is_none_or(|end| end > image.layout.stack_size as u64) {
            return Err(VmError::OutOfBoundsAccess {
                address,
                len: width.bytes(),
                arena: image.memory.len(),
            });
        }
        Ok(())
    }

    fn push_raw(&mut self, width: Width, value: u64) -> VmResult<()> {
        let sp = self.registers.sp();
        self.stack_guard(sp, width)?;
        self.image_mut()?.memory.store(sp, width, value)?;
        self.registers.set_sp(sp.wrapping_add(width.bytes() as u64));
        Ok(())
    }

    fn pop_raw(&mut self, width: Width) -> VmResult<u64> {
        let sp = self.registers.sp().wrapping_sub(width.bytes() as u64);
        self.stack_guard(sp, width)?;
        let value = self.image()?.memory.load(sp, width)?;
        self.registers.set_sp(sp);
        Ok(value)
    }

    /// Pops `argc` words as one block; the arguments come back in push order.
    fn pop_args(&mut self, argc: u32) -> VmResult<Vec<Slot>> {
        let sp = self.registers.sp();
        let len = argc as usize * Width::Word.bytes();
        let base = sp.checked_sub(len as u64).ok_or(VmError::OutOfBoundsAccess {
            address: sp,
            len,
            arena: self.image()?.memory.len(),
        })?;
        let args = self
            .memory(base, len)?
            .chunks_exact(Width::Word.bytes())
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                Slot::from_bits(u64::from_le_bytes(raw))
            })
            .collect();
        self.registers.set_sp(base);
        Ok(args)
    }

    fn call_native(&mut self, index: i64, slot: usize, args: &[Slot]) -> VmResult<()> {
        let native = self
            .natives
            .get(slot)
            .cloned()
            .ok_or(VmError::UndefinedFunction(index))?;
        let mut ret = Slot::ZERO;
        native.call(self, args, &mut ret)?;
        self.registers.set(Register::ACCUMULATOR, ret);
        Ok(())
    }
}

fn float_view(raw: u64, width: Width, operand: Operand) -> VmResult<f64> {
    match width {
        Width::Long | Width::Word => Ok(Slot::from_bits(raw).float(width)),
        _ => Err(VmError::InvalidAddressingMode(mode_of(operand, width))),
    }
}

fn float_bits(value: f64, width: Width) -> u64 {
    match width {
        Width::Long => Slot::from_f32(value as f32).bits(),
        _ => Slot::from_f64(value).bits(),
    }
}
