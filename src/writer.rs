//! Charset resolution and the text writer used by responses.

use std::fmt;

use crate::error::{ExchangeError, Result};
use crate::output::OutputGate;

/// Encoding used for HTML responses that declare none.
pub const DEFAULT_DOCUMENT_CHARACTER_ENCODING: &str = "ISO-8859-1";

/// Character encodings a [`TextWriter`] can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Utf8,
    Latin1,
    Ascii,
}

impl Charset {
    /// Looks an encoding up by its (case-insensitive) name or common alias.
    /// Names outside the three supported charsets, such as `UTF-16`, are
    /// rejected.
    pub fn for_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Charset::Utf8),
            "iso-8859-1" | "iso8859-1" | "latin1" | "latin-1" => Ok(Charset::Latin1),
            "us-ascii" | "ascii" => Ok(Charset::Ascii),
            _ => Err(ExchangeError::UnsupportedCharset(name.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::Latin1 => "ISO-8859-1",
            Charset::Ascii => "US-ASCII",
        }
    }

    /// Appends `text` to `out`. Characters the charset cannot represent
    /// become `?`.
    pub fn encode_into(self, text: &str, out: &mut Vec<u8>) {
        match self {
            Charset::Utf8 => out.extend_from_slice(text.as_bytes()),
            Charset::Latin1 => out.extend(text.chars().map(|c| {
                if (c as u32) <= 0xFF {
                    c as u8
                } else {
                    b'?'
                }
            })),
            Charset::Ascii => out.extend(text.chars().map(|c| if c.is_ascii() { c as u8 } else { b'?' })),
        }
    }
}

/// Whether a content type names an HTML document.
pub fn is_html(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|media| media.trim().eq_ignore_ascii_case("text/html"))
        .unwrap_or(false)
}

/// Picks the encoding a writer should use: the declared one, otherwise
/// ISO-8859-1 for HTML, otherwise `fallback`.
pub fn resolve_encoding<'a>(
    declared: Option<&'a str>,
    content_type: Option<&str>,
    fallback: &'a str,
) -> &'a str {
    match declared {
        Some(encoding) if !encoding.is_empty() => encoding,
        _ if is_html(content_type) => DEFAULT_DOCUMENT_CHARACTER_ENCODING,
        _ => fallback,
    }
}

/// Resolves the charset for a writer over `gate`, recording the chosen
/// encoding on the response when none was declared and it is not committed.
pub(crate) fn writer_charset(gate: &mut OutputGate, fallback: &str) -> Result<Charset> {
    let (declared, content_type, committed) = gate
        .inspect(|stream| {
            (
                stream.character_encoding().map(str::to_owned),
                stream.content_type().map(str::to_owned),
                stream.is_committed(),
            )
        })
        .ok_or(ExchangeError::Recycled("output gate"))?;

    let name = resolve_encoding(declared.as_deref(), content_type.as_deref(), fallback).to_string();
    let charset = Charset::for_name(&name)?;
    if declared.is_none() && !committed {
        gate.stream()?.set_character_encoding(&name)?;
    }
    Ok(charset)
}

/// Text writer over an [`OutputGate`].
///
/// Implements [`fmt::Write`], so `write!` works; use [`TextWriter::print`]
/// to see the underlying exchange error.
pub struct TextWriter<'a> {
    gate: &'a mut OutputGate,
    charset: Charset,
    scratch: Vec<u8>,
}

impl<'a> TextWriter<'a> {
    pub(crate) fn new(gate: &'a mut OutputGate, charset: Charset) -> Self {
        Self {
            gate,
            charset,
            scratch: Vec::new(),
        }
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    pub fn print(&mut self, text: &str) -> Result<()> {
        self.scratch.clear();
        self.charset.encode_into(text, &mut self.scratch);
        self.gate.write(&self.scratch)
    }

    pub fn println(&mut self, text: &str) -> Result<()> {
        self.print(text)?;
        self.print("\r\n")
    }

    pub fn flush(&mut self) -> Result<()> {
        self.gate.flush()
    }
}

impl fmt::Write for TextWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.print(s).map_err(|_| fmt::Error)
    }
}
