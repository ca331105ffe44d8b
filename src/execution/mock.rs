//! A scripted in-process backend.
//!
//! Understands a tiny line-oriented subset of C#-style statements so the
//! orchestrator and transport can be driven end to end without a toolchain:
//!
//! ```text
//! Console.WriteLine("Hello " + name);     Console.Write($"n = {n}");
//! Console.Error.WriteLine("oops");        var name = Console.ReadLine();
//! File.WriteAllText("out.txt", "data");   File.AppendAllText("log.txt", line);
//! Thread.Sleep(50);                       throw new Exception("boom");
//! return [1, 2, 3];                       #error message
//! ```
//!
//! Blank lines, comments, braces, `using` directives and member declarations
//! are skipped. Anything else is a compile error.

use std::collections::HashMap;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::execution::backend::{
    Artifact, BackendError, CompileRequest, ExecutionBackend, ExecutionOutcome, ProgramIo,
};
use crate::model::Diagnostic;

static WRITE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Console\.(?P<err>Error\.)?Write(?P<line>Line)?\((?P<args>.*)\);$").unwrap()
});
static READ: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?:var|string\??)\s+(?P<var>\w+)\s*=\s*)?Console\.ReadLine\(\);$").unwrap()
});
static FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^File\.(?P<op>WriteAllText|AppendAllText)\((?P<args>.*)\);$").unwrap()
});
static THROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^throw new (?P<ty>[\w.]+)\(\s*"(?P<msg>[^"]*)"\s*\);$"#).unwrap()
});
static SLEEP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Thread\.Sleep\((?P<ms>\d+)\);$").unwrap());
static RETURN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^return\s+(?P<value>.+);$").unwrap());
static SKIP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:$|//|using\s|[;{}]+$|(?:public|private|internal|protected|static|class|namespace|async)\b|\[)")
        .unwrap()
});

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Literal(String),
    Interpolated(String),
    Var(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    Write {
        to_stderr: bool,
        newline: bool,
        terms: Vec<Term>,
    },
    Read {
        var: Option<String>,
    },
    WriteFile {
        append: bool,
        path: Vec<Term>,
        content: Vec<Term>,
    },
    Throw(String),
    Sleep(u64),
    Return(String),
}

fn read_string(chars: &mut Peekable<Chars<'_>>) -> Option<String> {
    let mut out = String::new();
    loop {
        match chars.next()? {
            '"' => return Some(out),
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                c => out.push(c),
            },
            c => out.push(c),
        }
    }
}

/// `"lit" + name + $"x {y}"`
fn parse_expr(src: &str) -> Option<Vec<Term>> {
    let mut terms = Vec::new();
    let mut chars = src.trim().chars().peekable();
    if chars.peek().is_none() {
        return Some(terms);
    }
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.peek().copied() {
            Some('"') => {
                chars.next();
                terms.push(Term::Literal(read_string(&mut chars)?));
            }
            Some('$') => {
                chars.next();
                if chars.next()? != '"' {
                    return None;
                }
                terms.push(Term::Interpolated(read_string(&mut chars)?));
            }
            Some(c) if c.is_alphanumeric() || c == '_' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '.' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if word.chars().all(|c| c.is_ascii_digit() || c == '.') {
                    terms.push(Term::Literal(word));
                } else {
                    terms.push(Term::Var(word));
                }
            }
            _ => return None,
        }
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            None => return Some(terms),
            Some('+') => continue,
            Some(_) => return None,
        }
    }
}

/// Split call arguments on top-level commas.
fn split_args(src: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in src.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            ',' if !in_string => {
                parts.push(&src[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&src[start..]);
    parts
}

fn parse_statement(line: &str) -> Option<Option<Stmt>> {
    if SKIP.is_match(line) {
        return Some(None);
    }
    if let Some(caps) = WRITE.captures(line) {
        return Some(Some(Stmt::Write {
            to_stderr: caps.name("err").is_some(),
            newline: caps.name("line").is_some(),
            terms: parse_expr(&caps["args"])?,
        }));
    }
    if let Some(caps) = READ.captures(line) {
        return Some(Some(Stmt::Read {
            var: caps.name("var").map(|m| m.as_str().to_string()),
        }));
    }
    if let Some(caps) = FILE.captures(line) {
        let args = split_args(&caps["args"]);
        if args.len() != 2 {
            return None;
        }
        return Some(Some(Stmt::WriteFile {
            append: &caps["op"] == "AppendAllText",
            path: parse_expr(args[0])?,
            content: parse_expr(args[1])?,
        }));
    }
    if let Some(caps) = THROW.captures(line) {
        let ty = &caps["ty"];
        let ty = if ty.contains('.') {
            ty.to_string()
        } else {
            format!("System.{}", ty)
        };
        return Some(Some(Stmt::Throw(format!("{}: {}", ty, &caps["msg"]))));
    }
    if let Some(caps) = SLEEP.captures(line) {
        return Some(Some(Stmt::Sleep(caps["ms"].parse().ok()?)));
    }
    if let Some(caps) = RETURN.captures(line) {
        return Some(Some(Stmt::Return(caps["value"].trim().to_string())));
    }
    None
}

fn parse_program(source: &str) -> Result<Vec<Stmt>, Vec<Diagnostic>> {
    let mut statements = Vec::new();
    let mut diagnostics = Vec::new();

    for (index, raw) in source.lines().enumerate() {
        let line_no = index as u32 + 1;
        let line = raw.trim();
        let column = (raw.len() - raw.trim_start().len()) as u32 + 1;

        if let Some(message) = line.strip_prefix("#error") {
            let mut diag = Diagnostic::error(message.trim(), line_no, column);
            diag.code = Some("CS1029".to_string());
            diag.end_column = column + line.chars().count() as u32;
            diagnostics.push(diag);
            continue;
        }
        match parse_statement(line) {
            Some(Some(stmt)) => statements.push(stmt),
            Some(None) => {}
            None => {
                let mut diag = Diagnostic::error(
                    format!("Unsupported statement '{}'", line),
                    line_no,
                    column,
                );
                diag.code = Some("CS8641".to_string());
                diagnostics.push(diag);
            }
        }
    }

    if diagnostics.is_empty() {
        Ok(statements)
    } else {
        Err(diagnostics)
    }
}

fn eval(terms: &[Term], vars: &HashMap<String, String>) -> Result<String, BackendError> {
    let mut out = String::new();
    for term in terms {
        match term {
            Term::Literal(text) => out.push_str(text),
            Term::Var(name) => out.push_str(lookup(name, vars)?),
            Term::Interpolated(template) => {
                let mut rest = template.as_str();
                while let Some(open) = rest.find('{') {
                    out.push_str(&rest[..open]);
                    let close = rest[open..]
                        .find('}')
                        .map(|c| open + c)
                        .ok_or_else(|| BackendError::Runtime("Unterminated interpolation hole".into()))?;
                    out.push_str(lookup(rest[open + 1..close].trim(), vars)?);
                    rest = &rest[close + 1..];
                }
                out.push_str(rest);
            }
        }
    }
    Ok(out)
}

fn lookup<'a>(name: &str, vars: &'a HashMap<String, String>) -> Result<&'a str, BackendError> {
    vars.get(name).map(String::as_str).ok_or_else(|| {
        BackendError::Runtime(format!(
            "The name '{}' does not exist in the current context",
            name
        ))
    })
}

/// In-process backend interpreting the statement subset above.
#[derive(Default)]
pub struct ScriptedBackend {
    compilations: AtomicUsize,
    invocations: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn compile(&self, request: &CompileRequest) -> Result<Artifact, BackendError> {
        self.compilations.fetch_add(1, Ordering::SeqCst);
        parse_program(&request.source).map_err(BackendError::Compile)?;
        Ok(Artifact::from_request(request))
    }

    async fn invoke(
        &self,
        artifact: &Artifact,
        io: &ProgramIo,
    ) -> Result<ExecutionOutcome, BackendError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let statements = parse_program(&artifact.source).map_err(BackendError::Compile)?;
        let mut vars = HashMap::new();

        for stmt in statements {
            if io.cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            match stmt {
                Stmt::Write {
                    to_stderr,
                    newline,
                    terms,
                } => {
                    let text = eval(&terms, &vars)?;
                    let writer = if to_stderr { &io.stderr } else { &io.stdout };
                    if newline {
                        writer.write_line(&text);
                    } else {
                        writer.write(&text);
                    }
                }
                Stmt::Read { var } => {
                    let line = io.stdin.read_line().await?;
                    if let Some(var) = var {
                        vars.insert(var, line);
                    }
                }
                Stmt::WriteFile {
                    append,
                    path,
                    content,
                } => {
                    let path = eval(&path, &vars)?;
                    let content = eval(&content, &vars)?;
                    let written = if append {
                        io.storage.append_text(&path, &content)?
                    } else {
                        io.storage.write_text(&path, &content)?
                    };
                    debug!(path = %written.display(), "Scripted program wrote a file");
                }
                Stmt::Throw(message) => return Err(BackendError::Runtime(message)),
                Stmt::Sleep(ms) => {
                    tokio::select! {
                        _ = io.cancel.cancelled() => return Err(BackendError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    }
                }
                Stmt::Return(value) => {
                    let value = match serde_json::from_str(&value) {
                        Ok(json) => json,
                        Err(_) => serde_json::Value::String(eval(
                            &parse_expr(&value).unwrap_or_default(),
                            &vars,
                        )?),
                    };
                    return Ok(ExecutionOutcome::with_value(value));
                }
            }
        }

        Ok(ExecutionOutcome::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_expr() {
        assert_eq!(
            parse_expr(r#""Hello " + name"#).unwrap(),
            vec![Term::Literal("Hello ".into()), Term::Var("name".into())]
        );
        assert_eq!(parse_expr("").unwrap(), vec![]);
        assert_eq!(parse_expr("42").unwrap(), vec![Term::Literal("42".into())]);
        assert!(parse_expr(r#""a" - b"#).is_none());
    }

    #[test]
    fn test_split_args_respects_strings() {
        assert_eq!(split_args(r#""a,b", c"#), vec![r#""a,b""#, " c"]);
    }

    #[test]
    fn test_parse_program_collects_diagnostics() {
        let diags = parse_program("Console.WriteLine(\"ok\");\n  #error nope\nfoo bar;").unwrap_err();
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].start_line, 2);
        assert_eq!(diags[0].start_column, 3);
        assert_eq!(diags[0].message, "nope");
        assert_eq!(diags[1].code.as_deref(), Some("CS8641"));
    }

    #[test]
    fn test_skips_declarations_and_comments() {
        let program = "using System;\n// note\nstatic void Helper() { }\n{\n;\n}\nConsole.WriteLine();";
        let statements = parse_program(program).unwrap();
        assert_eq!(statements.len(), 1);
    }

    #[test]
    fn test_eval_interpolation() {
        let mut vars = HashMap::new();
        vars.insert("n".to_string(), "7".to_string());
        let terms = parse_expr(r#"$"n = {n}!""#).unwrap();
        assert_eq!(eval(&terms, &vars).unwrap(), "n = 7!");
        assert!(eval(&[Term::Var("missing".into())], &vars).is_err());
    }
}
