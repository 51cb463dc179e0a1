//! Payload classification: decide what a file is before choosing how to
//! ship it and which remote install path applies.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

// Thin Mach-O, both endiannesses, 32- and 64-bit, plus the fat header.
const MACHO_MAGICS: [[u8; 4]; 6] = [
    [0xfe, 0xed, 0xfa, 0xce],
    [0xfe, 0xed, 0xfa, 0xcf],
    [0xce, 0xfa, 0xed, 0xfe],
    [0xcf, 0xfa, 0xed, 0xfe],
    [0xca, 0xfe, 0xba, 0xbe],
    [0xca, 0xfe, 0xba, 0xbf],
];

/// How many leading bytes are enough for every magic/header check.
const HEADER_LEN: usize = 64;

/// Cap on how much of a file the text-based detectors will look at.
const TEXT_SCAN_LIMIT: u64 = 1024 * 1024;

/// What a payload turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadKind {
    Binary,
    Script,
    TypedScript,
    PythonScript,
    Compose,
    Zstd,
    Dockerfile,
    ImageReference,
    Unknown,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Binary => "binary",
            Self::Script => "script",
            Self::TypedScript => "typed-script",
            Self::PythonScript => "python-script",
            Self::Compose => "compose",
            Self::Zstd => "zstd",
            Self::Dockerfile => "dockerfile",
            Self::ImageReference => "image-reference",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Classify a local file against the remote host's platform.
///
/// Pure in the sense that the same file bytes and target always produce the
/// same answer. Native binaries for the wrong OS or machine word fail with
/// `ArchMismatch` instead of classifying.
pub fn detect(path: &Path, target_os: &str, target_arch: &str) -> Result<PayloadKind, Error> {
    if is_dockerfile_name(path) {
        return Ok(PayloadKind::Dockerfile);
    }

    let mut file = File::open(path).map_err(|e| Error::ClassifyFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut header = [0u8; HEADER_LEN];
    let header_len = read_up_to(&mut file, &mut header).map_err(|e| Error::ClassifyFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let header = &header[..header_len];

    if header.starts_with(&ELF_MAGIC) {
        return classify_elf(path, header, target_os, target_arch);
    }
    if header_len >= 4 && MACHO_MAGICS.iter().any(|m| header.starts_with(m)) {
        return classify_macho(path, header, target_os, target_arch);
    }
    if header.starts_with(&ZSTD_MAGIC) {
        return Ok(PayloadKind::Zstd);
    }
    if header.starts_with(b"#!") {
        return Ok(PayloadKind::Script);
    }

    // Everything past this point works on text.
    let Some(text) = read_text(&mut file, header) else {
        debug!(path = %path.display(), "payload is not text, classifying as unknown");
        return Ok(PayloadKind::Unknown);
    };

    // Compose is tested before typed-script, and typed-script before
    // python, so JavaScript-flavored python does not misclassify.
    if is_compose(&text) {
        return Ok(PayloadKind::Compose);
    }
    if is_typed_script(&text) {
        return Ok(PayloadKind::TypedScript);
    }
    if is_python(&text) {
        return Ok(PayloadKind::PythonScript);
    }

    Ok(PayloadKind::Unknown)
}

/// Does a non-file argument look like a container image reference?
/// Matches `registry/name[:tag]` and `name:tag` shapes.
pub fn is_image_reference(arg: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([a-z0-9._-]*[a-z0-9])?(/[a-z0-9]([a-z0-9._-]*[a-z0-9])?)*(:[A-Za-z0-9._-]+)?(@sha256:[a-f0-9]{64})?$")
            .expect("image reference regex")
    });
    // Require a slash or tag so bare words like "status" never match.
    (arg.contains('/') || arg.contains(':')) && !arg.contains("://") && re.is_match(arg)
}

fn is_dockerfile_name(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name == "Dockerfile" || name == "Containerfile" || name.ends_with(".dockerfile")
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Read the rest of the file and return it as a string when it looks like
/// text (valid UTF-8, no NUL bytes). Bounded by `TEXT_SCAN_LIMIT`.
fn read_text(file: &mut File, header: &[u8]) -> Option<String> {
    let mut bytes = header.to_vec();
    file.take(TEXT_SCAN_LIMIT)
        .read_to_end(&mut bytes)
        .ok()?;
    if bytes.contains(&0) {
        return None;
    }
    String::from_utf8(bytes).ok()
}

// ── Native binaries ─────────────────────────────────────────────────────

fn arch_mismatch(path: &Path, found: &str, target_os: &str, target_arch: &str) -> Error {
    Error::ArchMismatch {
        path: path.display().to_string(),
        found: found.to_string(),
        target_os: target_os.to_string(),
        target_arch: target_arch.to_string(),
    }
}

fn classify_elf(
    path: &Path,
    header: &[u8],
    target_os: &str,
    target_arch: &str,
) -> Result<PayloadKind, Error> {
    if target_os == "darwin" {
        return Err(arch_mismatch(path, "ELF", target_os, target_arch));
    }
    if header.len() < 20 {
        return Err(arch_mismatch(path, "truncated ELF", target_os, target_arch));
    }
    // e_machine sits at offset 18; EI_DATA at offset 5 picks the byte order.
    let little_endian = header[5] != 2;
    let e_machine = if little_endian {
        u16::from_le_bytes([header[18], header[19]])
    } else {
        u16::from_be_bytes([header[18], header[19]])
    };
    let machine = match e_machine {
        0x03 => "386",
        0x28 => "arm",
        0x3e => "amd64",
        0xb7 => "arm64",
        0xf3 => "riscv64",
        _ => "unknown",
    };
    if machine != normalize_arch(target_arch) {
        return Err(arch_mismatch(
            path,
            &format!("ELF {machine}"),
            target_os,
            target_arch,
        ));
    }
    Ok(PayloadKind::Binary)
}

fn classify_macho(
    path: &Path,
    header: &[u8],
    target_os: &str,
    target_arch: &str,
) -> Result<PayloadKind, Error> {
    if target_os != "darwin" {
        return Err(arch_mismatch(path, "Mach-O", target_os, target_arch));
    }
    if header.len() < 8 {
        return Err(arch_mismatch(
            path,
            "truncated Mach-O",
            target_os,
            target_arch,
        ));
    }
    // Universal binaries carry one slice per architecture; accept them.
    if header[0] == 0xca {
        return Ok(PayloadKind::Binary);
    }
    // Thin binary: cputype at offset 4, endianness given by the magic.
    let be = header[0] == 0xfe;
    let cputype = if be {
        u32::from_be_bytes([header[4], header[5], header[6], header[7]])
    } else {
        u32::from_le_bytes([header[4], header[5], header[6], header[7]])
    };
    let machine = match cputype {
        0x0100_0007 => "amd64",
        0x0100_000c => "arm64",
        0x0000_0007 => "386",
        0x0000_000c => "arm",
        _ => "unknown",
    };
    if machine != normalize_arch(target_arch) {
        return Err(arch_mismatch(
            path,
            &format!("Mach-O {machine}"),
            target_os,
            target_arch,
        ));
    }
    Ok(PayloadKind::Binary)
}

fn normalize_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "i386" | "i686" => "386",
        other => other,
    }
}

// ── Text formats ────────────────────────────────────────────────────────

/// A compose file is YAML with a top-level `services` mapping.
fn is_compose(text: &str) -> bool {
    let Ok(doc) = serde_yaml::from_str::<serde_yaml::Value>(text) else {
        return false;
    };
    matches!(
        doc.get("services"),
        Some(serde_yaml::Value::Mapping(m)) if !m.is_empty()
    )
}

struct TypedScriptSignals {
    annotation: Regex,
    interface: Regex,
    import_from: Regex,
    as_cast: Regex,
    export: Regex,
}

fn typed_script_signals() -> &'static TypedScriptSignals {
    static SIGNALS: OnceLock<TypedScriptSignals> = OnceLock::new();
    SIGNALS.get_or_init(|| TypedScriptSignals {
        annotation: Regex::new(
            r"[\w)\]]\s*:\s*(string|number|boolean|void|any|unknown|never|object|Promise\b|[A-Z]\w*(\[\])?)",
        )
        .expect("annotation regex"),
        interface: Regex::new(r"\b(interface|namespace)\s+[A-Za-z_$][\w$]*").expect("iface regex"),
        import_from: Regex::new(r#"\bimport\b[^;]*\bfrom\s+['"]"#).expect("import regex"),
        as_cast: Regex::new(r"\bas\s+(const\b|[A-Z]\w*)").expect("as-cast regex"),
        export: Regex::new(r"^\s*export\s+(default|const|let|function|async|class|interface|type|enum)\b")
            .expect("export regex"),
    })
}

/// Quick-pattern check over the first 20 non-blank lines, then a full
/// syntactic pass for files the quick check is unsure about.
fn is_typed_script(text: &str) -> bool {
    let signals = typed_script_signals();
    let mut hits = 0;
    for line in text.lines().filter(|l| !l.trim().is_empty()).take(20) {
        if signals.annotation.is_match(line) {
            hits += 1;
        }
        if signals.interface.is_match(line) {
            hits += 1;
        }
        if signals.import_from.is_match(line) {
            hits += 1;
        }
        if signals.as_cast.is_match(line) {
            hits += 1;
        }
        if signals.export.is_match(line) {
            hits += 1;
        }
        if hits >= 2 {
            return true;
        }
    }
    typed_script_parses(text)
}

/// Minimal whole-file syntax pass: balanced brackets outside strings and
/// comments, at least one statement shaped like JS/TS, and no python-style
/// block headers. Rejecting invalid input is all the classifier needs from
/// a parser here.
pub(crate) fn typed_script_parses(text: &str) -> bool {
    let mut depth_round = 0i32;
    let mut depth_curly = 0i32;
    let mut depth_square = 0i32;
    let mut statement_signal = false;
    let python_block = Regex::new(r"^\s*(def|elif|class)\s.*:\s*(#.*)?$").expect("py block regex");

    for line in text.lines() {
        if python_block.is_match(line) {
            return false;
        }
        let code = strip_line_noise(line);
        for ch in code.chars() {
            match ch {
                '(' => depth_round += 1,
                ')' => depth_round -= 1,
                '{' => depth_curly += 1,
                '}' => depth_curly -= 1,
                '[' => depth_square += 1,
                ']' => depth_square -= 1,
                _ => {}
            }
            if depth_round < 0 || depth_curly < 0 || depth_square < 0 {
                return false;
            }
        }
        let trimmed = code.trim();
        if trimmed.ends_with(';')
            || trimmed.ends_with('{')
            || trimmed.contains("=>")
            || trimmed.starts_with("const ")
            || trimmed.starts_with("let ")
            || trimmed.starts_with("function ")
        {
            statement_signal = true;
        }
    }

    statement_signal && depth_round == 0 && depth_curly == 0 && depth_square == 0
}

/// Drop string literals and line comments so brackets inside them don't
/// count. Not a tokenizer, just enough for balance checking.
fn strip_line_noise(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    let mut in_string: Option<char> = None;
    while let Some(ch) = chars.next() {
        match in_string {
            Some(quote) => {
                if ch == '\\' {
                    chars.next();
                } else if ch == quote {
                    in_string = None;
                }
            }
            None => match ch {
                '"' | '\'' | '`' => in_string = Some(ch),
                '/' if chars.peek() == Some(&'/') => break,
                _ => out.push(ch),
            },
        }
    }
    out
}

struct PythonSignals {
    import_: Regex,
    from_import: Regex,
    def_: Regex,
    class_: Regex,
    keywords: Regex,
}

fn python_signals() -> &'static PythonSignals {
    static SIGNALS: OnceLock<PythonSignals> = OnceLock::new();
    SIGNALS.get_or_init(|| PythonSignals {
        import_: Regex::new(r"^\s*import\s+[\w.]+\s*(#.*)?$").expect("import regex"),
        from_import: Regex::new(r"^\s*from\s+[\w.]+\s+import\s").expect("from-import regex"),
        def_: Regex::new(r"^\s*def\s+\w+\s*\(.*\)\s*(->\s*[\w\[\], .]+)?\s*:").expect("def regex"),
        class_: Regex::new(r"^\s*class\s+\w+(\(.*\))?\s*:").expect("class regex"),
        keywords: Regex::new(r"\b(elif|pass|lambda|self|__main__)\b").expect("keyword regex"),
    })
}

/// Python needs ≥2 signals in the first 20 lines, or an inline
/// `# /// script` metadata header terminated by `# ///`.
fn is_python(text: &str) -> bool {
    let lines: Vec<&str> = text.lines().take(20).collect();

    if let Some(start) = lines.iter().position(|l| l.trim() == "# /// script")
        && text
            .lines()
            .skip(start + 1)
            .any(|l| l.trim() == "# ///")
    {
        return true;
    }

    let signals = python_signals();
    let mut hits = 0;
    for line in &lines {
        if signals.import_.is_match(line) {
            hits += 1;
        }
        if signals.from_import.is_match(line) {
            hits += 1;
        }
        if signals.def_.is_match(line) {
            hits += 1;
        }
        if signals.class_.is_match(line) {
            hits += 1;
        }
        if signals.keywords.is_match(line) {
            hits += 1;
        }
        if hits >= 2 {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_payload(bytes: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    fn detect_bytes(bytes: &[u8], os: &str, arch: &str) -> Result<PayloadKind, Error> {
        let f = write_payload(bytes);
        detect(f.path(), os, arch)
    }

    fn elf_header(machine: u16) -> Vec<u8> {
        let mut h = vec![0u8; 64];
        h[..4].copy_from_slice(&ELF_MAGIC);
        h[4] = 2; // 64-bit
        h[5] = 1; // little endian
        h[18..20].copy_from_slice(&machine.to_le_bytes());
        h
    }

    fn macho_header(cputype: u32) -> Vec<u8> {
        let mut h = vec![0u8; 64];
        h[..4].copy_from_slice(&[0xcf, 0xfa, 0xed, 0xfe]);
        h[4..8].copy_from_slice(&cputype.to_le_bytes());
        h
    }

    #[test]
    fn elf_matching_arch_is_binary() {
        let kind = detect_bytes(&elf_header(0x3e), "linux", "amd64").unwrap();
        assert_eq!(kind, PayloadKind::Binary);
    }

    #[test]
    fn elf_accepts_goarch_spelling() {
        let kind = detect_bytes(&elf_header(0xb7), "linux", "aarch64").unwrap();
        assert_eq!(kind, PayloadKind::Binary);
    }

    #[test]
    fn elf_wrong_machine_word_fails() {
        let err = detect_bytes(&elf_header(0x3e), "linux", "arm64").unwrap_err();
        assert!(matches!(err, Error::ArchMismatch { .. }));
    }

    #[test]
    fn elf_for_darwin_target_fails() {
        let err = detect_bytes(&elf_header(0x3e), "darwin", "amd64").unwrap_err();
        assert!(matches!(err, Error::ArchMismatch { .. }));
    }

    #[test]
    fn macho_for_linux_target_fails() {
        let err = detect_bytes(&macho_header(0x0100_000c), "linux", "arm64").unwrap_err();
        assert!(matches!(err, Error::ArchMismatch { .. }));
    }

    #[test]
    fn macho_matching_cputype_is_binary() {
        let kind = detect_bytes(&macho_header(0x0100_000c), "darwin", "arm64").unwrap();
        assert_eq!(kind, PayloadKind::Binary);
    }

    #[test]
    fn zstd_magic_detected() {
        let kind = detect_bytes(&[0x28, 0xb5, 0x2f, 0xfd, 0, 0, 0], "linux", "amd64").unwrap();
        assert_eq!(kind, PayloadKind::Zstd);
    }

    #[test]
    fn shebang_is_script() {
        let kind = detect_bytes(b"#!/bin/sh\necho hi\n", "linux", "amd64").unwrap();
        assert_eq!(kind, PayloadKind::Script);
    }

    #[test]
    fn compose_needs_services_key() {
        let yes = b"services:\n  web:\n    image: nginx\n";
        assert_eq!(
            detect_bytes(yes, "linux", "amd64").unwrap(),
            PayloadKind::Compose
        );

        let no = b"version: '3'\nvolumes: {}\n";
        assert_ne!(
            detect_bytes(no, "linux", "amd64").unwrap(),
            PayloadKind::Compose
        );
    }

    #[test]
    fn compose_wins_over_typed_script() {
        // YAML that also contains a colon-heavy body stays compose.
        let text = b"services:\n  app:\n    image: ghcr.io/x/y:latest\n    command: node run\n";
        assert_eq!(
            detect_bytes(text, "linux", "amd64").unwrap(),
            PayloadKind::Compose
        );
    }

    #[test]
    fn typed_script_by_quick_signals() {
        let text = b"import { serve } from 'std/http';\nexport const port: number = 8080;\n";
        assert_eq!(
            detect_bytes(text, "linux", "amd64").unwrap(),
            PayloadKind::TypedScript
        );
    }

    #[test]
    fn typed_script_tested_before_python() {
        // `import`-style line plus annotations: must not fall through to python.
        let text = b"import { x } from 'mod';\nconst n: number = 1;\nfunction f(a: string): void {}\n";
        assert_eq!(
            detect_bytes(text, "linux", "amd64").unwrap(),
            PayloadKind::TypedScript
        );
    }

    #[test]
    fn python_by_signals() {
        let text = b"import os\n\ndef main():\n    pass\n";
        assert_eq!(
            detect_bytes(text, "linux", "amd64").unwrap(),
            PayloadKind::PythonScript
        );
    }

    #[test]
    fn python_inline_script_header() {
        let text = b"# /// script\n# dependencies = ['requests']\n# ///\nprint('hi')\n";
        assert_eq!(
            detect_bytes(text, "linux", "amd64").unwrap(),
            PayloadKind::PythonScript
        );
    }

    #[test]
    fn python_single_signal_is_not_enough() {
        let text = b"import sys\nthis is prose, not code\n";
        assert_eq!(
            detect_bytes(text, "linux", "amd64").unwrap(),
            PayloadKind::Unknown
        );
    }

    #[test]
    fn plain_text_is_unknown() {
        let text = b"hello world\njust some notes\n";
        assert_eq!(
            detect_bytes(text, "linux", "amd64").unwrap(),
            PayloadKind::Unknown
        );
    }

    #[test]
    fn binary_garbage_is_unknown() {
        let mut bytes = vec![0u8; 32];
        bytes[0] = 0x01;
        assert_eq!(
            detect_bytes(&bytes, "linux", "amd64").unwrap(),
            PayloadKind::Unknown
        );
    }

    #[test]
    fn dockerfile_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Dockerfile");
        std::fs::write(&path, "FROM alpine\n").unwrap();
        assert_eq!(
            detect(&path, "linux", "amd64").unwrap(),
            PayloadKind::Dockerfile
        );
    }

    #[test]
    fn detection_is_deterministic() {
        let f = write_payload(b"#!/usr/bin/env bash\n");
        for _ in 0..3 {
            assert_eq!(
                detect(f.path(), "linux", "amd64").unwrap(),
                PayloadKind::Script
            );
        }
    }

    #[test]
    fn image_reference_shapes() {
        assert!(is_image_reference("ghcr.io/x/y:tag"));
        assert!(is_image_reference("nginx:1.27"));
        assert!(is_image_reference("registry.local/team/app"));
        assert!(!is_image_reference("status"));
        assert!(!is_image_reference("./bin/app"));
        assert!(!is_image_reference("https://example.com/x"));
    }

    #[test]
    fn parse_fallback_rejects_python_blocks() {
        assert!(!typed_script_parses("def main():\n    return 1\n"));
        assert!(typed_script_parses("const x = () => {\n  return 1;\n};\n"));
    }
}
