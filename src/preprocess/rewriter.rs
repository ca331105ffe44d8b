use tracing::debug;

use crate::analysis::lexer::{tokenize, Token, TokenKind};
use crate::analysis::policy::is_same_or_member;
use crate::analysis::walker::{parse_using, UsingKind};
use crate::preprocess::{PreprocessRules, UnsupportedCall};

struct Edit {
    start: usize,
    end: usize,
    replacement: String,
}

/// Replace sandbox-incompatible calls and drop imports of removed namespaces.
///
/// A call used as a statement becomes an empty statement preceded by a comment;
/// a call used as a value becomes the configured replacement expression.
pub fn rewrite_unsupported(source: &str, rules: &PreprocessRules) -> String {
    let tokens = match tokenize(source) {
        Ok(tokens) => tokens,
        Err(e) => {
            debug!(error = %e, "Skipping unsupported-call rewrite");
            return source.to_string();
        }
    };

    // Significant tokens plus, for each, the index of the following raw token.
    let mut sig: Vec<Token<'_>> = Vec::new();
    let mut next_raw: Vec<usize> = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        if !token.kind.is_trivia() {
            sig.push(*token);
            next_raw.push(idx + 1);
        }
    }

    let mut edits = Vec::new();
    let mut i = 0;
    while i < sig.len() {
        if let Some(directive) = parse_using(&sig, i) {
            let namespace_removed = !matches!(directive.kind, UsingKind::Alias(_))
                && rules
                    .removed_namespaces
                    .iter()
                    .any(|ns| is_same_or_member(&directive.name, ns));
            if namespace_removed {
                let start = match i.checked_sub(1).map(|p| &sig[p]) {
                    Some(prev) if prev.is_ident("global") => prev.start,
                    _ => sig[i].start,
                };
                let semicolon = directive.end - 1;
                let mut end = sig[semicolon].end();
                // Take the line break with it.
                if let Some(ws) = tokens.get(next_raw[semicolon]) {
                    if ws.kind == TokenKind::Whitespace {
                        if let Some(nl) = ws.text.find('\n') {
                            end = ws.start + nl + 1;
                        }
                    }
                }
                edits.push(Edit {
                    start,
                    end,
                    replacement: String::new(),
                });
            }
            i = directive.end;
            continue;
        }

        if let Some((call, close)) = match_call(&sig, i, rules) {
            let prev = i.checked_sub(1).map(|p| &sig[p]);
            let statement_start = match prev {
                None => true,
                Some(p) => {
                    p.is_punct(';')
                        || p.is_punct('{')
                        || p.is_punct('}')
                        || p.is_punct(')')
                        || p.is_ident("else")
                }
            };
            let terminated = sig.get(close + 1).is_some_and(|t| t.is_punct(';'));

            if statement_start && terminated {
                edits.push(Edit {
                    start: sig[i].start,
                    end: sig[close + 1].end(),
                    replacement: format!(
                        "// Removed unsupported API call: {}.{}()\n;",
                        call.receiver, call.method
                    ),
                });
                i = close + 2;
            } else {
                edits.push(Edit {
                    start: sig[i].start,
                    end: sig[close].end(),
                    replacement: call.replacement.clone(),
                });
                i = close + 1;
            }
            continue;
        }

        i += 1;
    }

    if edits.is_empty() {
        return source.to_string();
    }

    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    for edit in edits {
        out.push_str(&source[cursor..edit.start]);
        out.push_str(&edit.replacement);
        cursor = edit.end;
    }
    out.push_str(&source[cursor..]);
    out
}

/// `Receiver.Method(...)` at `i`, returning the rule and the index of `)`.
fn match_call<'r>(
    sig: &[Token<'_>],
    i: usize,
    rules: &'r PreprocessRules,
) -> Option<(&'r UnsupportedCall, usize)> {
    if sig[i].kind != TokenKind::Ident || i.checked_sub(1).is_some_and(|p| sig[p].is_punct('.')) {
        return None;
    }
    let call = rules.unsupported_calls.iter().find(|c| {
        sig[i].text == c.receiver
            && sig.get(i + 1).is_some_and(|t| t.is_punct('.'))
            && sig.get(i + 2).is_some_and(|t| t.is_ident(&c.method))
            && sig.get(i + 3).is_some_and(|t| t.is_punct('('))
    })?;

    let mut depth = 0usize;
    for (j, token) in sig.iter().enumerate().skip(i + 3) {
        if token.is_punct('(') {
            depth += 1;
        } else if token.is_punct(')') {
            depth -= 1;
            if depth == 0 {
                return Some((call, j));
            }
        }
    }
    None
}
