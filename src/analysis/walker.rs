use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::analysis::lexer::{significant, tokenize, Token, TokenKind};
use crate::analysis::policy::SafetyPolicy;
use crate::model::SafetyVerdict;

const UNSAFE_BLOCK: &str = "Unsafe code block detected.";
const NATIVE_INTEROP: &str =
    "Usage of DllImport attribute detected (P/Invoke), which may allow native calls.";
const DYNAMIC_BINDING: &str =
    "Usage of the 'dynamic' keyword detected, which may lead to unpredictable behavior.";

/// Keywords that may precede `(` without being a call.
const KEYWORDS: &[&str] = &[
    "using", "new", "unsafe", "dynamic", "if", "while", "for", "foreach", "switch", "return",
    "typeof", "nameof", "sizeof", "default", "catch", "lock", "fixed", "when", "await", "checked",
    "unchecked", "stackalloc",
];

fn namespace_warning(namespace: &str) -> String {
    format!(
        "Usage of namespace '{}' detected; operations might be restricted.",
        namespace
    )
}

fn unsafe_method_warning(name: &str) -> String {
    format!("Method '{}' is marked as unsafe.", name)
}

fn process_type_warning(type_name: &str) -> String {
    format!(
        "Instantiation of type '{}' detected, which may be used to start processes.",
        type_name
    )
}

/// Static pattern gate for submitted source.
///
/// Walks the token stream once and matches calls, constructions, imports and
/// modifiers against a [`SafetyPolicy`]. Any match makes the verdict unsafe.
/// This is a best-effort filter, not an isolation boundary.
#[derive(Debug, Clone, Default)]
pub struct SafetyAnalyzer {
    policy: SafetyPolicy,
}

impl SafetyAnalyzer {
    pub fn new(policy: SafetyPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// Analyze source text. Never fails: source that cannot be tokenized is unsafe.
    pub fn analyze(&self, source: &str) -> SafetyVerdict {
        let tokens = match tokenize(source) {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "Source could not be parsed, rejecting");
                return SafetyVerdict::from_warnings(vec![format!(
                    "Unable to parse the source code: {}.",
                    e
                )]);
            }
        };

        let sig = significant(&tokens);
        let scope = Scope::collect(&sig);
        let mut walk = Walk {
            policy: &self.policy,
            sig: &sig,
            scope,
            warnings: Vec::new(),
            seen: HashSet::new(),
            attribute_closers: HashSet::new(),
        };
        walk.run();

        debug!(warnings = walk.warnings.len(), "Safety analysis finished");
        SafetyVerdict::from_warnings(walk.warnings)
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum UsingKind {
    Namespace,
    Static,
    Alias(String),
}

#[derive(Debug)]
pub(crate) struct UsingDirective {
    pub(crate) kind: UsingKind,
    pub(crate) name: String,
    /// Index one past the terminating `;`
    pub(crate) end: usize,
}

/// Imports visible to the whole compilation unit.
#[derive(Debug, Default)]
struct Scope {
    directives: HashMap<usize, UsingDirective>,
    namespaces: Vec<String>,
    statics: Vec<String>,
    aliases: HashMap<String, String>,
}

impl Scope {
    fn collect(sig: &[Token<'_>]) -> Self {
        let mut scope = Scope::default();
        for i in 0..sig.len() {
            if let Some(directive) = parse_using(sig, i) {
                match &directive.kind {
                    UsingKind::Namespace => scope.namespaces.push(directive.name.clone()),
                    UsingKind::Static => scope.statics.push(directive.name.clone()),
                    UsingKind::Alias(alias) => {
                        scope.aliases.insert(alias.clone(), directive.name.clone());
                    }
                }
                scope.directives.insert(i, directive);
            }
        }
        scope
    }
}

fn ident_text<'a>(token: &Token<'a>) -> &'a str {
    token.text.trim_start_matches('@')
}

/// Read `A.B.C` (optionally `global::`-prefixed) starting at `i`.
pub(crate) fn dotted(sig: &[Token<'_>], mut i: usize) -> Option<(Vec<String>, usize)> {
    if sig.get(i).is_some_and(|t| t.is_ident("global"))
        && sig.get(i + 1).is_some_and(|t| t.is_punct(':'))
        && sig.get(i + 2).is_some_and(|t| t.is_punct(':'))
    {
        i += 3;
    }
    let first = sig.get(i).filter(|t| t.kind == TokenKind::Ident)?;
    let mut parts = vec![ident_text(first).to_string()];
    i += 1;
    while sig.get(i).is_some_and(|t| t.is_punct('.'))
        && sig.get(i + 1).is_some_and(|t| t.kind == TokenKind::Ident)
    {
        parts.push(ident_text(&sig[i + 1]).to_string());
        i += 2;
    }
    Some((parts, i))
}

/// Skip a generic argument list `<...>` at `i`. Returns the index after `>`.
pub(crate) fn skip_type_arguments(sig: &[Token<'_>], i: usize) -> Option<usize> {
    if !sig.get(i)?.is_punct('<') {
        return None;
    }
    let mut depth = 0usize;
    for (offset, token) in sig[i..].iter().enumerate() {
        match token.kind {
            TokenKind::Ident => {}
            TokenKind::Punct if token.is_punct('<') => depth += 1,
            TokenKind::Punct if token.is_punct('>') => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + offset + 1);
                }
            }
            TokenKind::Punct
                if token.is_punct('.')
                    || token.is_punct(',')
                    || token.is_punct('?')
                    || token.is_punct('[')
                    || token.is_punct(']') => {}
            _ => return None,
        }
    }
    None
}

pub(crate) fn parse_using(sig: &[Token<'_>], i: usize) -> Option<UsingDirective> {
    if !sig[i].is_ident("using") {
        return None;
    }
    if let Some(prev) = i.checked_sub(1).map(|p| &sig[p]) {
        let allowed =
            prev.is_punct(';') || prev.is_punct('{') || prev.is_punct('}') || prev.is_ident("global");
        if !allowed {
            return None;
        }
    }

    let mut j = i + 1;
    let mut kind = UsingKind::Namespace;
    if sig.get(j).is_some_and(|t| t.is_ident("static")) {
        kind = UsingKind::Static;
        j += 1;
    }
    if sig.get(j).is_some_and(|t| t.kind == TokenKind::Ident)
        && sig.get(j + 1).is_some_and(|t| t.is_punct('='))
    {
        kind = UsingKind::Alias(ident_text(&sig[j]).to_string());
        j += 2;
    }

    let (parts, mut end) = dotted(sig, j)?;
    if let Some(after) = skip_type_arguments(sig, end) {
        end = after;
    }
    if !sig.get(end)?.is_punct(';') {
        return None;
    }

    Some(UsingDirective {
        kind,
        name: parts.join("."),
        end: end + 1,
    })
}

struct Walk<'p, 's, 'a> {
    policy: &'p SafetyPolicy,
    sig: &'s [Token<'a>],
    scope: Scope,
    warnings: Vec<String>,
    seen: HashSet<String>,
    attribute_closers: HashSet<usize>,
}

impl<'p, 's, 'a> Walk<'p, 's, 'a> {
    fn warn(&mut self, warning: String) {
        if self.seen.insert(warning.clone()) {
            self.warnings.push(warning);
        }
    }

    fn prev(&self, i: usize) -> Option<&Token<'a>> {
        i.checked_sub(1).map(|p| &self.sig[p])
    }

    fn run(&mut self) {
        let mut i = 0;
        while i < self.sig.len() {
            i = self.visit(i);
        }
    }

    /// Visit the token at `i` and return the next index to visit.
    fn visit(&mut self, i: usize) -> usize {
        let token = self.sig[i];

        if let Some(directive) = self.scope.directives.get(&i) {
            let (name, end) = (directive.name.clone(), directive.end);
            if self.policy.is_restricted_namespace(&name) {
                self.warn(namespace_warning(&name));
            }
            return end;
        }

        if token.is_punct('[') && self.opens_attribute(i) {
            self.visit_attribute_list(i);
            return i + 1;
        }

        if token.kind != TokenKind::Ident {
            return i + 1;
        }

        match token.text {
            "unsafe" => {
                self.visit_unsafe(i);
                i + 1
            }
            "dynamic" => {
                self.warn(DYNAMIC_BINDING.to_string());
                i + 1
            }
            "new" => self.visit_object_creation(i),
            text if KEYWORDS.contains(&text) => i + 1,
            _ => self.visit_chain(i),
        }
    }

    fn opens_attribute(&self, i: usize) -> bool {
        match self.prev(i) {
            None => true,
            Some(prev) => {
                prev.is_punct(';')
                    || prev.is_punct('{')
                    || prev.is_punct('}')
                    || (prev.is_punct(']') && self.attribute_closers.contains(&(i - 1)))
            }
        }
    }

    /// `[target: Name(args), Other]`
    fn visit_attribute_list(&mut self, open: usize) {
        let mut depth = 0usize;
        let mut expect_name = true;
        let mut j = open;
        while j < self.sig.len() {
            let t = self.sig[j];
            if t.is_punct('[') || t.is_punct('(') {
                depth += 1;
            } else if t.is_punct(']') || t.is_punct(')') {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    self.attribute_closers.insert(j);
                    return;
                }
            } else if depth == 1 && t.is_punct(',') {
                expect_name = true;
            } else if depth == 1 && expect_name && t.kind == TokenKind::Ident {
                // Skip an `assembly:`/`return:` target specifier.
                if self.sig.get(j + 1).is_some_and(|n| n.is_punct(':'))
                    && !self.sig.get(j + 2).is_some_and(|n| n.is_punct(':'))
                {
                    j += 2;
                    continue;
                }
                if let Some((parts, end)) = dotted(self.sig, j) {
                    if self.policy.is_native_interop_attribute(&parts.join(".")) {
                        self.warn(NATIVE_INTEROP.to_string());
                    }
                    expect_name = false;
                    j = end;
                    continue;
                }
            }
            j += 1;
        }
    }

    fn visit_unsafe(&mut self, i: usize) {
        if self.sig.get(i + 1).is_some_and(|t| t.is_punct('{')) {
            self.warn(UNSAFE_BLOCK.to_string());
            return;
        }

        // Modifier: find the declared name right before the parameter list.
        let sig = self.sig;
        let mut name: Option<&str> = None;
        let mut angle = 0usize;
        for t in &sig[i + 1..] {
            if t.is_punct('{') || t.is_punct(';') || t.is_punct('=') {
                return;
            }
            if t.is_punct('<') {
                angle += 1;
            } else if t.is_punct('>') {
                angle = angle.saturating_sub(1);
            } else if t.is_punct('(') {
                if let Some(name) = name {
                    self.warn(unsafe_method_warning(name));
                }
                return;
            } else if t.kind == TokenKind::Ident && angle == 0 {
                name = Some(ident_text(t));
            }
        }
    }

    fn visit_object_creation(&mut self, i: usize) -> usize {
        let Some((parts, end)) = dotted(self.sig, i + 1) else {
            return i + 1;
        };
        let type_name = self.resolve_type(&parts);
        if let Some((_, warning)) = self.lookup_any(&parts) {
            self.warn(warning);
        }
        if self.policy.is_process_type(&type_name) {
            self.warn(process_type_warning(&type_name));
        }
        end
    }

    fn visit_chain(&mut self, i: usize) -> usize {
        if self
            .prev(i)
            .is_some_and(|p| p.is_punct('.') || p.is_ident("new"))
        {
            return i + 1;
        }
        let Some((parts, end)) = dotted(self.sig, i) else {
            return i + 1;
        };
        let call = skip_type_arguments(self.sig, end).unwrap_or(end);
        if !self.sig.get(call).is_some_and(|t| t.is_punct('(')) {
            return end;
        }

        let resolved = match self.lookup_any(&parts) {
            Some((fqn, warning)) => {
                self.warn(warning);
                fqn
            }
            None => parts.join("."),
        };

        // Containing namespace of `Namespace.Type.Method`.
        let segments: Vec<&str> = resolved.split('.').collect();
        if segments.len() > 2 {
            let namespace = segments[..segments.len() - 2].join(".");
            if self.policy.is_restricted_namespace(&namespace) {
                self.warn(namespace_warning(&namespace));
            }
        }
        end
    }

    /// Every fully-qualified name `parts` may refer to, most literal first.
    fn candidates(&self, parts: &[String]) -> Vec<String> {
        let literal = parts.join(".");
        let mut out = vec![literal.clone()];
        if let Some(target) = self.scope.aliases.get(&parts[0]) {
            let mut aliased = vec![target.clone()];
            aliased.extend(parts[1..].iter().cloned());
            out.push(aliased.join("."));
        }
        for ns in self
            .scope
            .statics
            .iter()
            .chain(self.scope.namespaces.iter())
            .chain(self.policy.default_imports.iter())
        {
            out.push(format!("{}.{}", ns, literal));
        }
        out
    }

    fn lookup_any(&self, parts: &[String]) -> Option<(String, String)> {
        self.candidates(parts).into_iter().find_map(|candidate| {
            self.policy
                .lookup(&candidate)
                .map(|(_, warning)| warning.to_string())
                .map(|warning| (candidate, warning))
        })
    }

    /// Best guess at the type a `new` expression constructs.
    fn resolve_type(&self, parts: &[String]) -> String {
        if let Some((fqn, _)) = self.lookup_any(parts) {
            return fqn;
        }
        if let Some(target) = self.scope.aliases.get(&parts[0]) {
            let mut aliased = vec![target.clone()];
            aliased.extend(parts[1..].iter().cloned());
            return aliased.join(".");
        }
        let literal = parts.join(".");
        if parts.len() == 1 {
            if let Some(ns) = self
                .scope
                .namespaces
                .iter()
                .find(|ns| self.policy.is_restricted_namespace(ns))
            {
                return format!("{}.{}", ns, literal);
            }
        }
        literal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(src: &str) -> SafetyVerdict {
        SafetyAnalyzer::default().analyze(src)
    }

    fn count(verdict: &SafetyVerdict, needle: &str) -> usize {
        verdict.warnings.iter().filter(|w| w.contains(needle)).count()
    }

    #[test]
    fn test_plain_code_is_safe() {
        let verdict = analyze(
            "var items = new List<int> { 1, 2, 3 };\nConsole.WriteLine(items.Sum());\nreturn items.Where(x => x > 1);",
        );
        assert!(verdict.is_safe, "{:?}", verdict.warnings);
    }

    #[test]
    fn test_process_start_flagged_once() {
        let verdict = analyze(
            "using System.Diagnostics;\nProcess.Start(\"ls\");\nProcess.Start(\"pwd\");",
        );
        assert!(!verdict.is_safe);
        assert_eq!(count(&verdict, "Usage of Process.Start detected"), 1);
        assert_eq!(
            count(&verdict, "Usage of namespace 'System.Diagnostics' detected"),
            1
        );
    }

    #[test]
    fn test_qualified_namespace_call_deduplicated() {
        let verdict = analyze(
            "var a = System.IO.File.ReadAllText(\"a\");\nvar b = System.IO.File.ReadAllText(\"b\");",
        );
        assert_eq!(
            verdict.warnings,
            vec!["Usage of namespace 'System.IO' detected; operations might be restricted."]
        );
    }

    #[test]
    fn test_environment_via_default_import() {
        let verdict = analyze("Environment.Exit(1);");
        assert_eq!(
            verdict.warnings,
            vec!["Usage of Environment.Exit detected, which may terminate the process."]
        );
    }

    #[test]
    fn test_literals_and_comments_ignored() {
        let verdict = analyze(
            "// Process.Start(\"x\")\nConsole.WriteLine(\"Environment.Exit(0)\"); /* unsafe { } */",
        );
        assert!(verdict.is_safe, "{:?}", verdict.warnings);
    }

    #[test]
    fn test_unsafe_block_and_method() {
        let verdict = analyze(
            "class C {\n  static unsafe void Poke<T>(int* p) { }\n  void M() { unsafe { } }\n}",
        );
        assert_eq!(
            verdict.warnings,
            vec![
                "Method 'Poke' is marked as unsafe.".to_string(),
                UNSAFE_BLOCK.to_string()
            ]
        );
    }

    #[test]
    fn test_unsafe_type_is_not_a_method() {
        let verdict = analyze("unsafe struct S { int x; }");
        assert!(verdict.is_safe);
    }

    #[test]
    fn test_native_interop_attribute() {
        let verdict = analyze(
            "[DllImport(\"libc\")]\nstatic extern int getpid();\n[Serializable, System.Runtime.InteropServices.DllImportAttribute(\"k\")]\nstatic extern int x();",
        );
        assert_eq!(verdict.warnings, vec![NATIVE_INTEROP.to_string()]);
    }

    #[test]
    fn test_indexer_is_not_an_attribute() {
        let verdict = analyze("var DllImport = 0; var a = new int[3]; a[DllImport] = 1;");
        assert!(verdict.is_safe, "{:?}", verdict.warnings);
    }

    #[test]
    fn test_dynamic_binding() {
        let verdict = analyze("dynamic d = 1;\ndynamic e = d;");
        assert_eq!(verdict.warnings, vec![DYNAMIC_BINDING.to_string()]);
    }

    #[test]
    fn test_process_construction() {
        let verdict = analyze("using System.Diagnostics;\nvar p = new Process();");
        assert!(verdict.warnings.contains(&process_type_warning("System.Diagnostics.Process")));
    }

    #[test]
    fn test_http_client_construction() {
        let verdict = analyze("using System.Net.Http;\nvar c = new HttpClient();");
        assert!(verdict
            .warnings
            .iter()
            .any(|w| w.contains("(HttpClient)")));
        assert!(verdict
            .warnings
            .contains(&namespace_warning("System.Net.Http")));
    }

    #[test]
    fn test_alias_and_static_imports_resolve() {
        let verdict = analyze("using static System.Environment;\nExit(0);");
        assert!(verdict.warnings.iter().any(|w| w.contains("Environment.Exit")));

        let verdict = analyze("using Sys = System.Environment;\nSys.Exit(0);");
        assert!(verdict.warnings.iter().any(|w| w.contains("Environment.Exit")));
    }

    #[test]
    fn test_using_statement_is_not_a_directive() {
        let verdict = analyze("using (var s = new MemoryStreamLike()) { }\nusing var t = Make();");
        assert!(verdict.is_safe, "{:?}", verdict.warnings);
    }

    #[test]
    fn test_unparsable_source_fails_closed() {
        let verdict = analyze("Console.WriteLine(\"unterminated);");
        assert!(!verdict.is_safe);
        assert!(verdict.warnings[0].starts_with("Unable to parse the source code"));
    }

    #[test]
    fn test_custom_policy() {
        let mut policy = SafetyPolicy::default();
        policy
            .dangerous_apis
            .insert("System.Console.Beep".to_string(), "Beep detected.".to_string());
        let verdict = SafetyAnalyzer::new(policy).analyze("Console.Beep();");
        assert_eq!(verdict.warnings, vec!["Beep detected."]);
    }
}
