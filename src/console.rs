//! Interactive prompt input

use std::io::{BufRead, Write};

use crate::error::{Error, Result};

/// Print `question` and read one line of answer.
///
/// The trailing newline (and carriage return) is stripped; everything else,
/// including trailing punctuation, is kept as typed.
pub fn read_prompt<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    question: &str,
) -> Result<String> {
    writeln!(writer, "{question}").map_err(|e| Error::io("<stdout>", e))?;
    writer.flush().map_err(|e| Error::io("<stdout>", e))?;

    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| Error::io("<stdin>", e))?;
    if read == 0 {
        return Err(Error::EmptyInput);
    }

    let trimmed = line.trim_end_matches(['\n', '\r']);
    Ok(trimmed.to_string())
}
