//! Length-prefixed instruction framing for the guacd protocol.
//!
//! Wire format: `len.value,len.value,...;` where `len` is the UTF-8 byte
//! length of `value` in decimal ASCII.
//!
//! Framing is delimiter-based: an instruction ends at the first `;`. The
//! length prefixes are informational and are stripped, never used for
//! slicing. The buffer is byte-oriented; `;`, `,` and `.` are ASCII and can
//! never appear inside a multi-byte UTF-8 sequence, so cutting on them never
//! splits a code point.

use std::fmt;

/// Terminates every instruction.
pub const INSTRUCTION_TERMINATOR: u8 = b';';
/// Separates the fields of an instruction.
pub const FIELD_SEPARATOR: u8 = b',';
/// Separates a field's length prefix from its value.
pub const LENGTH_SEPARATOR: u8 = b'.';

/// One protocol instruction: an opcode followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    fields: Vec<String>,
}

impl Instruction {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// All fields, opcode included.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<String> {
        self.fields
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Vec<u8> {
        encode(self.fields.iter().map(|f| Some(f.as_str())))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fields.join(","))
    }
}

/// Encode a sequence of fields into one wire instruction.
///
/// A `None` field is written as the empty field `0.`.
pub fn encode<I, S>(fields: I) -> Vec<u8>
where
    I: IntoIterator<Item = Option<S>>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(FIELD_SEPARATOR);
        }
        let value = field.as_ref().map(|s| s.as_ref()).unwrap_or("");
        out.extend_from_slice(value.len().to_string().as_bytes());
        out.push(LENGTH_SEPARATOR);
        out.extend_from_slice(value.as_bytes());
    }
    out.push(INSTRUCTION_TERMINATOR);
    out
}

/// Decode the first complete instruction in `buffer`.
///
/// Returns the instruction and the number of bytes it occupied (terminator
/// included), or `None` if no terminator has arrived yet.
pub fn decode_one(buffer: &[u8]) -> Option<(Instruction, usize)> {
    let end = buffer.iter().position(|&b| b == INSTRUCTION_TERMINATOR)?;
    let fields = buffer[..end]
        .split(|&b| b == FIELD_SEPARATOR)
        .map(|field| String::from_utf8_lossy(strip_length(field)).into_owned())
        .collect();
    Some((Instruction { fields }, end + 1))
}

/// Drop the `len.` prefix of a field. A field without a `.` is returned as is.
fn strip_length(field: &[u8]) -> &[u8] {
    match field.iter().position(|&b| b == LENGTH_SEPARATOR) {
        Some(dot) => &field[dot + 1..],
        None => field,
    }
}

/// Accumulates bytes received from the daemon.
///
/// Supports two consumption modes: [`next_instruction`](Self::next_instruction)
/// pulls one parsed instruction at a time (used during the handshake), and
/// [`take_complete`](Self::take_complete) drains every complete instruction
/// as one opaque chunk (used for bulk forwarding).
#[derive(Debug, Default)]
pub struct InstructionBuffer {
    buffer: Vec<u8>,
}

impl InstructionBuffer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Remove and return the first complete instruction.
    pub fn next_instruction(&mut self) -> Option<Instruction> {
        let (instruction, consumed) = decode_one(&self.buffer)?;
        self.buffer.drain(..consumed);
        Some(instruction)
    }

    /// Remove and return everything up to and including the last `;`.
    ///
    /// A trailing partial instruction stays buffered for the next read.
    pub fn take_complete(&mut self) -> Option<Vec<u8>> {
        let last = self
            .buffer
            .iter()
            .rposition(|&b| b == INSTRUCTION_TERMINATOR)?;
        let rest = self.buffer.split_off(last + 1);
        Some(std::mem::replace(&mut self.buffer, rest))
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
