//! Console formatting shared by the interpreter and the JIT host handler,
//! so both engines produce byte-identical observable output.

use std::io::{BufRead, Write};

#[derive(Debug)]
pub(crate) enum ReadError {
    Io(std::io::Error),
    Malformed(String),
}

pub(crate) fn write_int(out: &mut dyn Write, value: i32) -> std::io::Result<()> {
    writeln!(out, "{}", value)
}

pub(crate) fn write_float(out: &mut dyn Write, value: f32) -> std::io::Result<()> {
    writeln!(out, "{}", value)
}

/// Chars are raw bytes, no trailing newline.
pub(crate) fn write_char(out: &mut dyn Write, value: u8) -> std::io::Result<()> {
    out.write_all(&[value])
}

fn read_trimmed(input: &mut dyn BufRead) -> Result<String, ReadError> {
    let mut line = String::new();
    input.read_line(&mut line).map_err(ReadError::Io)?;
    Ok(line.trim().to_string())
}

pub(crate) fn read_int(input: &mut dyn BufRead) -> Result<i32, ReadError> {
    let line = read_trimmed(input)?;
    line.parse::<i32>().map_err(|_| ReadError::Malformed(line))
}

pub(crate) fn read_float(input: &mut dyn BufRead) -> Result<f32, ReadError> {
    let line = read_trimmed(input)?;
    line.parse::<f32>().map_err(|_| ReadError::Malformed(line))
}

pub(crate) fn read_char(input: &mut dyn BufRead) -> Result<u8, ReadError> {
    let line = read_trimmed(input)?;
    match line.bytes().next() {
        Some(b) => Ok(b),
        None => Err(ReadError::Malformed(line)),
    }
}
