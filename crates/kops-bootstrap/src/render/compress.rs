use super::RenderError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;

const PAYLOAD_HEREDOC: &str = "__EOF_PAYLOAD";

/// Gzip with a zeroed header mtime, so output depends only on input.
pub(crate) fn gzip(data: &[u8]) -> Result<Vec<u8>, RenderError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Wraps `script` in a stub that decompresses and runs it.
///
/// The script is decoded into a shell variable and evaluated by the stub's
/// own bash, so nothing is written to disk and stdin stays untouched.
pub(crate) fn self_extracting(script: &str) -> Result<String, RenderError> {
    let encoded = STANDARD.encode(gzip(script.as_bytes())?);
    let mut out = String::new();
    out.push_str("#!/bin/bash\n");
    out.push_str("set -e -o pipefail\n");
    out.push_str(&format!("script=\"$(base64 -d << '{PAYLOAD_HEREDOC}' | gzip -d\n"));
    // base64 alphabet never produces the terminator line
    for chunk in encoded.as_bytes().chunks(76) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(PAYLOAD_HEREDOC);
    out.push('\n');
    out.push_str(")\"\n");
    out.push_str("eval \"${script}\"\n");
    Ok(out)
}
