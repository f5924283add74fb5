//! Opcodes, instruction parsing, and script builders.

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// Legacy sigop weight of a bare multisig check.
const MULTISIG_SIGOPS: u32 = 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Instruction<'a> {
    /// Data pushed by a direct push or one of the PUSHDATA opcodes.
    Push(&'a [u8]),
    Op(u8),
}

/// Raised when a push runs past the end of the script.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TruncatedPush;

pub struct Instructions<'a> {
    script: &'a [u8],
    cursor: usize,
}

pub fn instructions(script: &[u8]) -> Instructions<'_> {
    Instructions { script, cursor: 0 }
}

impl<'a> Instructions<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], TruncatedPush> {
        let script: &'a [u8] = self.script;
        let end = self.cursor.checked_add(len).ok_or(TruncatedPush)?;
        let bytes = script.get(self.cursor..end).ok_or(TruncatedPush)?;
        self.cursor = end;
        Ok(bytes)
    }

    fn take_len<const N: usize>(&mut self) -> Result<usize, TruncatedPush> {
        let bytes = self.take(N)?;
        let mut buf = [0u8; 4];
        buf[..N].copy_from_slice(bytes);
        Ok(u32::from_le_bytes(buf) as usize)
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, TruncatedPush>;

    fn next(&mut self) -> Option<Self::Item> {
        let opcode = *self.script.get(self.cursor)?;
        self.cursor += 1;
        let len = match opcode {
            0x01..=0x4b => Ok(opcode as usize),
            OP_PUSHDATA1 => self.take_len::<1>(),
            OP_PUSHDATA2 => self.take_len::<2>(),
            OP_PUSHDATA4 => self.take_len::<4>(),
            _ => return Some(Ok(Instruction::Op(opcode))),
        };
        let item = len
            .and_then(|len| self.take(len))
            .map(Instruction::Push);
        if item.is_err() {
            self.cursor = self.script.len();
        }
        Some(item)
    }
}

/// True when every instruction is a data push or a small-integer push.
pub fn is_push_only(script: &[u8]) -> bool {
    instructions(script).all(|instruction| match instruction {
        Ok(Instruction::Push(_)) => true,
        Ok(Instruction::Op(opcode)) => opcode == OP_0 || (OP_1NEGATE..=OP_16).contains(&opcode),
        Err(TruncatedPush) => false,
    })
}

/// Signature operations counted without executing the script. Parsing stops
/// at a truncated push.
pub fn legacy_sigops(script: &[u8]) -> u32 {
    let mut count = 0u32;
    for instruction in instructions(script) {
        match instruction {
            Ok(Instruction::Op(OP_CHECKSIG | OP_CHECKSIGVERIFY)) => count += 1,
            Ok(Instruction::Op(OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY)) => {
                count += MULTISIG_SIGOPS
            }
            Ok(_) => {}
            Err(TruncatedPush) => break,
        }
    }
    count
}

/// Data payloads of the script's pushes, or `None` if it is not push-only.
pub fn pushed_data(script: &[u8]) -> Option<Vec<&[u8]>> {
    let mut pushes = Vec::new();
    for instruction in instructions(script) {
        match instruction.ok()? {
            Instruction::Push(data) => pushes.push(data),
            Instruction::Op(OP_0) => pushes.push(&[]),
            Instruction::Op(opcode) if (OP_1NEGATE..=OP_16).contains(&opcode) => {
                pushes.push(&[])
            }
            Instruction::Op(_) => return None,
        }
    }
    Some(pushes)
}

pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    if data.len() < OP_PUSHDATA1 as usize {
        script.push(data.len() as u8);
    } else if data.len() <= u8::MAX as usize {
        script.push(OP_PUSHDATA1);
        script.push(data.len() as u8);
    } else if data.len() <= u16::MAX as usize {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(data.len() as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(data.len() as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

/// Minimal push of a script number.
pub fn push_int(value: i64) -> Vec<u8> {
    if value == 0 {
        return vec![OP_0];
    }
    if value == -1 {
        return vec![OP_1NEGATE];
    }
    if (1..=16).contains(&value) {
        return vec![OP_1 + (value as u8 - 1)];
    }
    let mut script = Vec::new();
    push_data(&mut script, &script_num_to_vec(value));
    script
}

fn script_num_to_vec(value: i64) -> Vec<u8> {
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if let Some(last) = result.last_mut() {
        if (*last & 0x80) != 0 {
            result.push(if value < 0 { 0x80 } else { 0 });
        } else if value < 0 {
            *last |= 0x80;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_int_encodings() {
        assert_eq!(push_int(0), vec![OP_0]);
        assert_eq!(push_int(16), vec![OP_16]);
        assert_eq!(push_int(17), vec![0x01, 0x11]);
        assert_eq!(push_int(128), vec![0x02, 0x80, 0x00]);
        assert_eq!(push_int(227_931), vec![0x03, 0x5b, 0x7a, 0x03]);
    }

    #[test]
    fn sigops_stop_at_truncated_push() {
        let script = [OP_CHECKSIG, OP_CHECKMULTISIG, 0x05, 0x01];
        assert_eq!(legacy_sigops(&script), 21);
        let hidden = [0x01, OP_CHECKSIG, OP_CHECKSIGVERIFY];
        assert_eq!(legacy_sigops(&hidden), 1);
    }

    #[test]
    fn push_only_detection() {
        let mut script = Vec::new();
        push_data(&mut script, &[0xaa; 80]);
        script.push(OP_1);
        assert!(is_push_only(&script));
        assert_eq!(pushed_data(&script).map(|pushes| pushes.len()), Some(2));
        script.push(OP_DUP);
        assert!(!is_push_only(&script));
        assert!(pushed_data(&script).is_none());
        assert!(!is_push_only(&[OP_PUSHDATA1]));
    }
}
