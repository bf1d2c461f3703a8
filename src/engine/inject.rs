//! Rewrites the job's build-time constants before a build.
//!
//! The document is line oriented. A declaration is `#define NAME VALUE`, where
//! VALUE is either a bare token (no whitespace, no `/`) or a parenthesized
//! expression. Only the value token of a recognized declaration is replaced;
//! separators, trailing comments, line endings and every other byte of the
//! document are kept as they were.

use crate::error::ConfigError;
use crate::model::RunParameters;
use std::io::ErrorKind;
use std::ops::Range;
use std::path::Path;

const DIRECTIVE: &str = "#define";

pub const BODY_COUNT_NAME: &str = "NUM_BODIES";
pub const WIDTH_NAME: &str = "WIDTH";
pub const HEIGHT_NAME: &str = "HEIGHT";

/// Names rewritten by [`inject_document`], in document-independent order.
pub const RECOGNIZED_NAMES: [&str; 3] = [BODY_COUNT_NAME, WIDTH_NAME, HEIGHT_NAME];

/// A recognized declaration found in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub name: &'static str,
    /// Value text without surrounding parentheses.
    pub value: String,
    pub parenthesized: bool,
    /// 1-based line number.
    pub line: usize,
}

struct ValueSpan {
    range: Range<usize>,
    parenthesized: bool,
}

struct RawDeclaration<'a> {
    name: &'a str,
    value: Option<ValueSpan>,
}

fn values_for(params: &RunParameters) -> [(&'static str, u64); 3] {
    [
        (BODY_COUNT_NAME, params.body_count),
        (WIDTH_NAME, u64::from(params.image_width)),
        (HEIGHT_NAME, u64::from(params.image_height)),
    ]
}

fn recognized(name: &str) -> Option<&'static str> {
    RECOGNIZED_NAMES.iter().copied().find(|n| *n == name)
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Scan one line for a `#define NAME ...` declaration.
///
/// Returns `None` when the line is not a declaration at all, and a declaration
/// with `value: None` when the name is present but the value cannot be parsed.
fn scan_line(line: &str) -> Option<RawDeclaration<'_>> {
    let body = line.trim_end_matches(['\n', '\r']);
    let indent = body.len() - body.trim_start().len();
    let rest = body[indent..].strip_prefix(DIRECTIVE)?;
    if !rest.starts_with(|c: char| c.is_whitespace()) {
        return None;
    }

    let name_start = indent + DIRECTIVE.len() + (rest.len() - rest.trim_start().len());
    let name_len = body[name_start..]
        .find(|c: char| !is_ident(c))
        .unwrap_or(body.len() - name_start);
    if name_len == 0 {
        return None;
    }
    let name = &body[name_start..name_start + name_len];

    let after_name = name_start + name_len;
    let tail = &body[after_name..];
    let gap = tail.len() - tail.trim_start().len();
    let value = if gap == 0 {
        // End of line, or a function-like macro `NAME(`.
        None
    } else {
        scan_value(body, after_name + gap)
    };

    Some(RawDeclaration { name, value })
}

fn scan_value(body: &str, start: usize) -> Option<ValueSpan> {
    let text = &body[start..];
    if text.starts_with('(') {
        let mut depth = 0usize;
        for (i, c) in text.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        if text[1..i].trim().is_empty() {
                            return None;
                        }
                        return Some(ValueSpan {
                            range: start..start + i + 1,
                            parenthesized: true,
                        });
                    }
                }
                _ => {}
            }
        }
        return None;
    }

    let len = text
        .find(|c: char| c.is_whitespace() || c == '/')
        .unwrap_or(text.len());
    if len == 0 {
        return None;
    }
    Some(ValueSpan {
        range: start..start + len,
        parenthesized: false,
    })
}

fn malformed(name: &'static str, idx: usize, line: &str) -> ConfigError {
    ConfigError::MalformedDeclaration {
        name,
        line: idx + 1,
        text: line.trim_end_matches(['\n', '\r']).to_string(),
    }
}

/// List the recognized declarations present in `doc`.
pub fn read_declarations(doc: &str) -> Result<Vec<Declaration>, ConfigError> {
    let mut out = Vec::new();
    for (idx, line) in doc.split_inclusive('\n').enumerate() {
        let Some(raw) = scan_line(line) else { continue };
        let Some(name) = recognized(raw.name) else { continue };
        let span = raw.value.ok_or_else(|| malformed(name, idx, line))?;
        let token = &line[span.range.clone()];
        let value = if span.parenthesized {
            token[1..token.len() - 1].trim().to_string()
        } else {
            token.to_string()
        };
        out.push(Declaration {
            name,
            value,
            parenthesized: span.parenthesized,
            line: idx + 1,
        });
    }
    Ok(out)
}

/// Return a copy of `doc` with the recognized declarations set from `params`.
pub fn inject_document(doc: &str, params: &RunParameters) -> Result<String, ConfigError> {
    let values = values_for(params);
    let mut seen = [false; 3];
    let mut out = String::with_capacity(doc.len() + 16);

    for (idx, line) in doc.split_inclusive('\n').enumerate() {
        let target = scan_line(line).and_then(|raw| {
            values
                .iter()
                .position(|(name, _)| *name == raw.name)
                .map(|pos| (pos, raw.value))
        });
        let Some((pos, span)) = target else {
            out.push_str(line);
            continue;
        };

        let (name, value) = values[pos];
        let span = span.ok_or_else(|| malformed(name, idx, line))?;
        seen[pos] = true;

        out.push_str(&line[..span.range.start]);
        if span.parenthesized {
            out.push('(');
            out.push_str(&value.to_string());
            out.push(')');
        } else {
            out.push_str(&value.to_string());
        }
        out.push_str(&line[span.range.end..]);
    }

    if let Some(pos) = seen.iter().position(|s| !s) {
        return Err(ConfigError::MissingDeclaration {
            name: values[pos].0,
        });
    }
    Ok(out)
}

fn read_document(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == ErrorKind::NotFound {
            ConfigError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

/// Read the declarations currently in the document at `path`.
pub fn read_declarations_at(path: &Path) -> Result<Vec<Declaration>, ConfigError> {
    read_declarations(&read_document(path)?)
}

/// Rewrite the document at `path` in place. No backup is kept.
pub fn inject(params: &RunParameters, path: &Path) -> Result<(), ConfigError> {
    let doc = read_document(path)?;
    let patched = inject_document(&doc, params)?;
    if patched == doc {
        tracing::debug!(path = %path.display(), "configuration already up to date");
        return Ok(());
    }
    std::fs::write(path, patched).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(
        path = %path.display(),
        bodies = params.body_count,
        width = params.image_width,
        height = params.image_height,
        "configuration written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "\
#ifndef CONSTANTS_H
#define CONSTANTS_H

#define WIDTH\t1024*2 // Image render width
#define HEIGHT\t1024*2 // Image render height
#define WIDTH_SCALE 3

#define SPACE_UNIT 1.5e11 // distance unit
#define NUM_BODIES (1e5) // Number of bodies
#define THETA 1
#endif //CONSTANTS_H
";

    fn params() -> RunParameters {
        RunParameters {
            body_count: 1000,
            frame_count: 10,
            image_width: 512,
            image_height: 256,
        }
    }

    fn value_of(decls: &[Declaration], name: &str) -> String {
        decls
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.value.clone())
            .unwrap()
    }

    #[test]
    fn reads_existing_declarations() {
        let decls = read_declarations(DOC).unwrap();
        assert_eq!(decls.len(), 3);
        assert_eq!(value_of(&decls, WIDTH_NAME), "1024*2");
        let bodies = decls.iter().find(|d| d.name == BODY_COUNT_NAME).unwrap();
        assert_eq!(bodies.value, "1e5");
        assert!(bodies.parenthesized);
        assert_eq!(bodies.line, 9);
    }

    #[test]
    fn injection_round_trips() {
        let patched = inject_document(DOC, &params()).unwrap();
        let decls = read_declarations(&patched).unwrap();
        assert_eq!(value_of(&decls, BODY_COUNT_NAME), "1000");
        assert_eq!(value_of(&decls, WIDTH_NAME), "512");
        assert_eq!(value_of(&decls, HEIGHT_NAME), "256");
    }

    #[test]
    fn unrecognized_lines_are_byte_identical() {
        let patched = inject_document(DOC, &params()).unwrap();
        let before: Vec<&str> = DOC.split_inclusive('\n').collect();
        let after: Vec<&str> = patched.split_inclusive('\n').collect();
        assert_eq!(before.len(), after.len());
        for (i, (b, a)) in before.iter().zip(&after).enumerate() {
            if [3, 4, 8].contains(&i) {
                continue;
            }
            assert_eq!(b, a, "line {}", i + 1);
        }
    }

    #[test]
    fn keeps_separator_comment_and_parentheses() {
        let patched = inject_document(DOC, &params()).unwrap();
        assert!(patched.contains("#define WIDTH\t512 // Image render width\n"));
        assert!(patched.contains("#define NUM_BODIES (1000) // Number of bodies\n"));
        assert!(patched.contains("#define WIDTH_SCALE 3\n"));
    }

    #[test]
    fn preserves_crlf_line_endings() {
        let doc = "#define NUM_BODIES 5\r\n#define WIDTH 1\r\n#define HEIGHT 2\r\n";
        let patched = inject_document(doc, &params()).unwrap();
        assert_eq!(
            patched,
            "#define NUM_BODIES 1000\r\n#define WIDTH 512\r\n#define HEIGHT 256\r\n"
        );
    }

    #[test]
    fn reinjecting_same_values_is_stable() {
        let once = inject_document(DOC, &params()).unwrap();
        let twice = inject_document(&once, &params()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn malformed_recognized_declaration_is_rejected() {
        let doc = "#define NUM_BODIES (1e5\n#define WIDTH 1\n#define HEIGHT 2\n";
        match inject_document(doc, &params()) {
            Err(ConfigError::MalformedDeclaration { name, line, .. }) => {
                assert_eq!(name, BODY_COUNT_NAME);
                assert_eq!(line, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let doc = "#define NUM_BODIES 1\n#define WIDTH\n#define HEIGHT 2\n";
        assert!(matches!(
            inject_document(doc, &params()),
            Err(ConfigError::MalformedDeclaration { name: WIDTH_NAME, line: 2, .. })
        ));
    }

    #[test]
    fn malformed_unrecognized_declaration_is_ignored() {
        let doc = "#define OTHER\n#define NUM_BODIES 1\n#define WIDTH 1\n#define HEIGHT 2\n";
        let patched = inject_document(doc, &params()).unwrap();
        assert!(patched.starts_with("#define OTHER\n"));
    }

    #[test]
    fn missing_declaration_is_reported() {
        let doc = "#define NUM_BODIES 1\n#define WIDTH 1\n";
        assert!(matches!(
            inject_document(doc, &params()),
            Err(ConfigError::MissingDeclaration { name: HEIGHT_NAME })
        ));
    }

    #[test]
    fn inject_rewrites_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Constants.h");
        std::fs::write(&path, DOC).unwrap();

        inject(&params(), &path).unwrap();

        let decls = read_declarations_at(&path).unwrap();
        assert_eq!(value_of(&decls, HEIGHT_NAME), "256");
    }

    #[test]
    fn inject_reports_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.h");
        assert!(matches!(
            inject(&params(), &path),
            Err(ConfigError::NotFound { .. })
        ));
    }
}
