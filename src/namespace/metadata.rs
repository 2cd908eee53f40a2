//! Parser for the `<name>.meta.textproto` sidecar that accompanies every package image (§6).
//!
//! The grammar is a minimal, line-oriented `key: "value"` / `key { ... }` format: scalar string
//! fields and one repeated substructure (`runtime_union { pkg: "..." dir: "..." }`). It is
//! hand-written rather than generated, since only these few field shapes are ever consumed, but
//! it follows protobuf text-format's own forward-compatibility rule: unknown top-level keys and
//! unknown fields inside a block are skipped rather than rejected, so a store built by a newer
//! version of the thing that writes these sidecars doesn't break an older mount.

use crate::error::{Error, Result};

/// One `runtime_union { pkg: "..." dir: "..." }` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeUnion {
    pub pkg: String,
    pub dir: String,
}

/// Parsed contents of a package's metadata sidecar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageMeta {
    pub source_pkg: String,
    pub version: String,
    pub runtime_unions: Vec<RuntimeUnion>,
}

struct Tokens<'a> {
    rest: &'a str,
}

enum Token<'a> {
    Ident(&'a str),
    Str(&'a str),
    LBrace,
    RBrace,
}

impl<'a> Tokens<'a> {
    fn new(src: &'a str) -> Self {
        Self { rest: src }
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start_matches(|c: char| c.is_whitespace() || c == ':');
    }

    fn next(&mut self) -> Result<Option<Token<'a>>> {
        self.skip_ws();
        if self.rest.is_empty() {
            return Ok(None);
        }
        let mut chars = self.rest.char_indices();
        let (_, first) = chars.next().expect("checked non-empty above");
        match first {
            '{' => {
                self.rest = &self.rest[1..];
                Ok(Some(Token::LBrace))
            }
            '}' => {
                self.rest = &self.rest[1..];
                Ok(Some(Token::RBrace))
            }
            '"' => {
                let after_quote = &self.rest[1..];
                let end = after_quote
                    .find('"')
                    .ok_or_else(|| Error::MalformedMetadata("unterminated string".into()))?;
                let value = &after_quote[..end];
                self.rest = &after_quote[end + 1..];
                Ok(Some(Token::Str(value)))
            }
            c if c.is_alphanumeric() || c == '_' => {
                let end = self
                    .rest
                    .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                    .unwrap_or(self.rest.len());
                let ident = &self.rest[..end];
                self.rest = &self.rest[end..];
                Ok(Some(Token::Ident(ident)))
            }
            other => Err(Error::MalformedMetadata(format!(
                "unexpected character {other:?}"
            ))),
        }
    }
}

/// Parses the textual contents of a metadata sidecar.
pub fn parse(src: &str) -> Result<PackageMeta> {
    let mut tokens = Tokens::new(src);
    let mut meta = PackageMeta::default();

    while let Some(tok) = tokens.next()? {
        let key = match tok {
            Token::Ident(k) => k,
            Token::RBrace => {
                return Err(Error::MalformedMetadata("unmatched '}'".into()));
            }
            _ => return Err(Error::MalformedMetadata("expected a field name".into())),
        };

        match key {
            "source_pkg" => meta.source_pkg = expect_str(&mut tokens)?.to_string(),
            "version" => meta.version = expect_str(&mut tokens)?.to_string(),
            "runtime_union" => meta.runtime_unions.push(parse_runtime_union(&mut tokens)?),
            _ => skip_unknown_field(&mut tokens)?,
        }
    }

    Ok(meta)
}

fn expect_str<'a>(tokens: &mut Tokens<'a>) -> Result<&'a str> {
    match tokens.next()? {
        Some(Token::Str(s)) => Ok(s),
        _ => Err(Error::MalformedMetadata(
            "expected a quoted string value".into(),
        )),
    }
}

fn parse_runtime_union(tokens: &mut Tokens<'_>) -> Result<RuntimeUnion> {
    match tokens.next()? {
        Some(Token::LBrace) => {}
        _ => {
            return Err(Error::MalformedMetadata(
                "expected '{' after runtime_union".into(),
            ))
        }
    }

    let mut pkg = None;
    let mut dir = None;
    loop {
        match tokens.next()? {
            Some(Token::RBrace) => break,
            Some(Token::Ident("pkg")) => pkg = Some(expect_str(tokens)?.to_string()),
            Some(Token::Ident("dir")) => dir = Some(expect_str(tokens)?.to_string()),
            Some(Token::Ident(_)) => skip_unknown_field(tokens)?,
            _ => {
                return Err(Error::MalformedMetadata(
                    "malformed runtime_union block".into(),
                ))
            }
        }
    }

    Ok(RuntimeUnion {
        pkg: pkg.ok_or_else(|| Error::MalformedMetadata("runtime_union missing pkg".into()))?,
        dir: dir.ok_or_else(|| Error::MalformedMetadata("runtime_union missing dir".into()))?,
    })
}

/// Skips an unrecognized field's value, whether it's a scalar or a nested block, so that
/// sidecars from a newer writer remain parseable.
fn skip_unknown_field(tokens: &mut Tokens<'_>) -> Result<()> {
    match tokens.next()? {
        Some(Token::Str(_)) => Ok(()),
        Some(Token::LBrace) => {
            let mut depth = 1;
            while depth > 0 {
                match tokens.next()? {
                    Some(Token::LBrace) => depth += 1,
                    Some(Token::RBrace) => depth -= 1,
                    Some(_) => {}
                    None => {
                        return Err(Error::MalformedMetadata(
                            "unterminated block in unknown field".into(),
                        ))
                    }
                }
            }
            Ok(())
        }
        _ => Err(Error::MalformedMetadata("malformed field value".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalars() {
        let meta = parse(r#"source_pkg: "less" version: "530-2""#).unwrap();
        assert_eq!(meta.source_pkg, "less");
        assert_eq!(meta.version, "530-2");
        assert!(meta.runtime_unions.is_empty());
    }

    #[test]
    fn parses_runtime_unions() {
        let meta = parse(
            r#"
            source_pkg: "bash"
            version: "1"
            runtime_union {
                pkg: "glibc-amd64"
                dir: "lib"
            }
            "#,
        )
        .unwrap();
        assert_eq!(
            meta.runtime_unions,
            vec![RuntimeUnion {
                pkg: "glibc-amd64".into(),
                dir: "lib".into(),
            }]
        );
    }

    #[test]
    fn ignores_unknown_top_level_fields() {
        let meta = parse(r#"source_pkg: "x" built_by: "ci" version: "1""#).unwrap();
        assert_eq!(meta.source_pkg, "x");
        assert_eq!(meta.version, "1");
    }

    #[test]
    fn ignores_unknown_fields_inside_block_and_nested_blocks() {
        let meta = parse(
            r#"
            runtime_union {
                pkg: "a"
                dir: "b"
                extra { nested: "ignored" }
            }
            "#,
        )
        .unwrap();
        assert_eq!(meta.runtime_unions[0].pkg, "a");
        assert_eq!(meta.runtime_unions[0].dir, "b");
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(parse(r#"source_pkg: "unterminated"#).is_err());
    }

    #[test]
    fn rejects_unmatched_brace() {
        assert!(parse("}").is_err());
    }

    #[test]
    fn empty_input_is_valid() {
        let meta = parse("").unwrap();
        assert_eq!(meta, PackageMeta::default());
    }
}
