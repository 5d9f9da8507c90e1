//! PowerShell command encoding and chunking.
//!
//! PowerShell's `-EncodedCommand` takes base64 over UTF-16LE. Commands whose
//! UTF-16LE form exceeds [`DIRECT_COMMAND_LIMIT`] are instead written to a
//! temporary script in [`CHUNK_SIZE`] pieces and run with `-File`.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use uuid::Uuid;

/// Largest UTF-16LE command (in bytes) sent as a single encoded command.
pub const DIRECT_COMMAND_LIMIT: usize = 2000;

/// UTF-16LE bytes carried by each append step of the chunked path.
pub const CHUNK_SIZE: usize = 4000;

pub fn utf16le_bytes(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

pub fn utf16le_len(text: &str) -> usize {
    text.encode_utf16().count() * 2
}

/// Lossy UTF-16LE decode; a trailing odd byte is dropped.
pub fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Base64 of the UTF-16LE encoding, as accepted by `-EncodedCommand`.
pub fn encode_powershell(text: &str) -> String {
    BASE64_STANDARD.encode(utf16le_bytes(text))
}

/// Whether `text` fits the direct `-EncodedCommand` path.
pub fn fits_direct(text: &str) -> bool {
    utf16le_len(text) <= DIRECT_COMMAND_LIMIT
}

/// Split the UTF-16LE form of `text` into `CHUNK_SIZE` byte chunks (the last
/// may be shorter), each returned base64 encoded. Chunks are cut on byte
/// boundaries only; the remote side appends raw bytes, so a surrogate pair
/// cut in two is rejoined in the staged file.
pub fn split_command(text: &str) -> Vec<String> {
    utf16le_bytes(text)
        .chunks(CHUNK_SIZE)
        .map(|chunk| BASE64_STANDARD.encode(chunk))
        .collect()
}

/// `C:\<uuid without dashes>.ps1`
pub fn temp_script_path() -> String {
    format!("C:\\{}.ps1", Uuid::new_v4().simple())
}

pub fn encoded_command_line(text: &str) -> String {
    format!("powershell -encodedcommand \"{}\"", encode_powershell(text))
}

/// Decode one base64 chunk and append its raw bytes to `path`. The first
/// append to an empty file writes the UTF-16LE byte order mark.
pub fn append_chunk_line(path: &str, chunk: &str) -> String {
    format!(
        "powershell -NoProfile -NonInteractive -Command \"$f=[System.IO.File]::Open('{}','Append'); if ($f.Length -eq 0) {{ $f.Write([byte[]](0xFF,0xFE),0,2) }}; $b=[System.Convert]::FromBase64String('{}'); $f.Write($b,0,$b.Length); $f.Close()\"",
        path, chunk
    )
}

pub fn run_script_line(path: &str) -> String {
    format!(
        "powershell -NoProfile -NonInteractive -ExecutionPolicy Bypass -File {}",
        path
    )
}

pub fn delete_file_line(path: &str) -> String {
    format!("del /f {}", path)
}
