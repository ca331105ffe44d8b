use tracing::debug;

use crate::analysis::lexer::{significant, tokenize, Token};
use crate::analysis::walker::{dotted, parse_using};

const DECLARATION_MODIFIERS: &[&str] = &[
    "public",
    "private",
    "protected",
    "internal",
    "static",
    "sealed",
    "partial",
    "abstract",
    "unsafe",
    "file",
];

/// Cheap textual check for a wrapped program: an entry class and an entry call site.
pub fn is_wrapped_program(source: &str, entry_class: &str, entry_method: &str) -> bool {
    source.contains(&format!("class {}", entry_class))
        && source.contains(&format!("{}(", entry_method))
}

fn is_open(t: &Token<'_>) -> bool {
    t.is_punct('{') || t.is_punct('(') || t.is_punct('[')
}

fn is_close(t: &Token<'_>) -> bool {
    t.is_punct('}') || t.is_punct(')') || t.is_punct(']')
}

/// Index of the bracket closing the one at `open`.
fn matching(sig: &[Token<'_>], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, t) in sig.iter().enumerate().skip(open) {
        if is_open(t) {
            depth += 1;
        } else if is_close(t) {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// Split a type body into member token ranges (inclusive).
fn split_members(sig: &[Token<'_>], open: usize, close: usize) -> Vec<(usize, usize)> {
    let mut members = Vec::new();
    let mut start = open + 1;
    let mut depth = 0usize;
    for i in open + 1..close {
        let t = &sig[i];
        if is_open(t) {
            depth += 1;
        } else if is_close(t) {
            depth = depth.saturating_sub(1);
            if depth == 0 && t.is_punct('}') {
                // `int X { get; } = 1;` and `Func<int> f = () => { ... };` run on to the `;`.
                let continues = sig
                    .get(i + 1)
                    .is_some_and(|n| n.is_punct('=') || n.is_punct(';'))
                    && i + 1 < close;
                if !continues {
                    members.push((start, i));
                    start = i + 1;
                }
            }
        } else if depth == 0 && t.is_punct(';') {
            members.push((start, i));
            start = i + 1;
        }
    }
    if start < close {
        members.push((start, close - 1));
    }
    members
}

/// Statement text of the entry method, if the member is it.
fn entry_body(
    source: &str,
    sig: &[Token<'_>],
    member: (usize, usize),
    entry_method: &str,
) -> Option<String> {
    let (first, last) = member;
    let mut depth = 0usize;
    let mut params = None;
    for i in first..=last {
        let t = &sig[i];
        if t.is_punct('(') && depth == 0 {
            params = Some(i);
            break;
        }
        if is_open(t) {
            depth += 1;
        } else if is_close(t) {
            depth = depth.saturating_sub(1);
        }
    }
    let params = params?;

    // Name right before the parameter list, skipping `<T>`.
    let mut name_idx = params.checked_sub(1)?;
    if sig[name_idx].is_punct('>') {
        let mut angle = 0usize;
        loop {
            if sig[name_idx].is_punct('>') {
                angle += 1;
            } else if sig[name_idx].is_punct('<') {
                angle -= 1;
                if angle == 0 {
                    break;
                }
            }
            name_idx = name_idx.checked_sub(1)?;
        }
        name_idx = name_idx.checked_sub(1)?;
    }
    if name_idx < first || !sig[name_idx].is_ident(entry_method) {
        return None;
    }
    if !sig[first..name_idx].iter().any(|t| t.is_ident("static")) {
        return None;
    }

    let params_close = matching(sig, params)?;
    let mut i = params_close + 1;
    while i <= last {
        if sig[i].is_punct('{') {
            let close = matching(sig, i)?;
            return Some(source[sig[i].end()..sig[close].start].to_string());
        }
        if sig[i].is_punct('=') && sig.get(i + 1).is_some_and(|t| t.is_punct('>')) {
            return Some(source[sig[i + 1].end()..sig[last].end()].to_string());
        }
        i += 1;
    }
    None
}

/// Strip common indentation and surrounding blank lines.
fn dedent(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);
    let stripped: Vec<&str> = lines
        .iter()
        .map(|l| if l.trim().is_empty() { "" } else { &l[indent..] })
        .collect();
    let first = stripped.iter().position(|l| !l.is_empty());
    let last = stripped.iter().rposition(|l| !l.is_empty());
    match (first, last) {
        (Some(a), Some(b)) => stripped[a..=b].join("\n"),
        _ => String::new(),
    }
}

/// Byte range of a using directive at `i`, `global` prefix included.
fn using_span(sig: &[Token<'_>], i: usize, end: usize) -> (usize, usize) {
    let start = match i.checked_sub(1).map(|p| &sig[p]) {
        Some(prev) if prev.is_ident("global") => prev.start,
        _ => sig[i].start,
    };
    (start, sig[end - 1].end())
}

/// Flatten a wrapped program into script form.
///
/// The result is every distinct using directive, then the entry method's
/// statements, then the entry class's remaining members, then any other
/// top-level declarations. Input without the entry class is returned unchanged.
pub fn strip_program_wrapper(source: &str, entry_class: &str, entry_method: &str) -> String {
    let tokens = match tokenize(source) {
        Ok(tokens) => tokens,
        Err(e) => {
            debug!(error = %e, "Skipping wrapper strip");
            return source.to_string();
        }
    };
    let sig = significant(&tokens);

    let Some(class_kw) = (0..sig.len().saturating_sub(1))
        .find(|&i| sig[i].is_ident("class") && sig[i + 1].is_ident(entry_class))
    else {
        return source.to_string();
    };
    let Some(open) = (class_kw + 2..sig.len()).find(|&i| sig[i].is_punct('{')) else {
        return source.to_string();
    };
    let Some(close) = matching(&sig, open) else {
        return source.to_string();
    };

    // Spans removed to find the remaining top-level declarations.
    let mut removed: Vec<(usize, usize)> = Vec::new();

    let mut usings: Vec<String> = Vec::new();
    for i in 0..sig.len() {
        if let Some(directive) = parse_using(&sig, i) {
            let span = using_span(&sig, i, directive.end);
            let text = source[span.0..span.1].trim().to_string();
            if !usings.contains(&text) {
                usings.push(text);
            }
            removed.push(span);
        }
    }

    let mut decl_start = class_kw;
    while let Some(prev) = decl_start.checked_sub(1) {
        if DECLARATION_MODIFIERS.iter().any(|m| sig[prev].is_ident(m)) {
            decl_start = prev;
        } else if sig[prev].is_punct(']') {
            match (0..prev)
                .rev()
                .find(|&j| sig[j].is_punct('[') && matching(&sig, j) == Some(prev))
            {
                Some(j) => decl_start = j,
                None => break,
            }
        } else {
            break;
        }
    }
    removed.push((sig[decl_start].start, sig[close].end()));

    for i in 0..sig.len() {
        if !sig[i].is_ident("namespace") {
            continue;
        }
        if let Some((_, end)) = dotted(&sig, i + 1) {
            match sig.get(end) {
                Some(t) if t.is_punct('{') => {
                    removed.push((sig[i].start, t.end()));
                    if let Some(body_close) = matching(&sig, end) {
                        removed.push((sig[body_close].start, sig[body_close].end()));
                    }
                }
                Some(t) if t.is_punct(';') => removed.push((sig[i].start, t.end())),
                _ => {}
            }
        }
    }

    let mut main_body = String::new();
    let mut others = Vec::new();
    let mut prev_end = sig[open].end();
    for member in split_members(&sig, open, close) {
        let member_end = sig[member.1].end();
        match entry_body(source, &sig, member, entry_method) {
            Some(body) if main_body.is_empty() => main_body = dedent(&body),
            _ => others.push(dedent(&source[prev_end..member_end])),
        }
        prev_end = member_end;
    }

    removed.sort_unstable();
    let mut leftover = String::new();
    let mut cursor = 0;
    for (start, end) in removed {
        if start >= cursor {
            leftover.push_str(&source[cursor..start]);
            cursor = end;
        }
    }
    leftover.push_str(&source[cursor..]);
    let leftover = dedent(&leftover);

    let mut out = String::new();
    for u in &usings {
        out.push_str(u);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&main_body);
    out.push_str("\n\n");
    out.push_str(&others.join("\n\n"));
    out.push('\n');
    if !leftover.is_empty() {
        out.push('\n');
        out.push_str(&leftover);
        out.push('\n');
    }
    out
}
