use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The denylist the safety analyzer matches submissions against.
///
/// Loaded from the `[safety]` config section (and an optional policy file), so
/// the table can change without a rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyPolicy {
    /// Fully-qualified name -> warning. A key naming a type also matches its members.
    pub dangerous_apis: BTreeMap<String, String>,
    /// Namespace prefixes whose import or use is flagged
    pub restricted_namespaces: Vec<String>,
    /// Attribute names granting native interop
    pub native_interop_attributes: Vec<String>,
    /// Substrings of a constructed type name that indicate process spawning
    pub process_type_markers: Vec<String>,
    /// Namespaces visible without a using directive
    pub default_imports: Vec<String>,
}

const DEFAULT_DANGEROUS_APIS: &[(&str, &str)] = &[
    (
        "System.Diagnostics.Process.Start",
        "Usage of Process.Start detected, which may allow spawning external processes.",
    ),
    (
        "System.IO.File.Open",
        "Usage of file I/O operations detected, which may be dangerous in untrusted code.",
    ),
    (
        "System.Reflection.Assembly.Load",
        "Usage of assembly loading detected, which may allow dynamic code execution.",
    ),
    (
        "System.Reflection.Assembly.LoadFrom",
        "Usage of assembly loading detected, which may allow dynamic code execution.",
    ),
    (
        "System.Activator.CreateInstance",
        "Usage of Activator.CreateInstance detected, which may allow dynamic type instantiation.",
    ),
    (
        "System.Net.Http.HttpClient",
        "Usage of network communication APIs detected (HttpClient), which may be unsafe.",
    ),
    (
        "System.Net.WebClient",
        "Usage of network communication APIs detected (WebClient), which may be unsafe.",
    ),
    (
        "Microsoft.CodeAnalysis.CSharp.Scripting.CSharpScript",
        "Usage of Roslyn scripting APIs detected, which may allow dynamic code execution.",
    ),
    (
        "System.Runtime.InteropServices.Marshal",
        "Usage of Marshal class detected, which may allow unsafe memory operations.",
    ),
    (
        "System.GCHandle",
        "Usage of GCHandle detected, which may allow unsafe memory pinning.",
    ),
    (
        "System.Threading.Thread",
        "Usage of threading APIs detected, which may lead to concurrency issues.",
    ),
    (
        "System.Threading.Tasks.Task",
        "Usage of threading APIs detected, which may lead to concurrency issues.",
    ),
    (
        "System.AppDomain",
        "Usage of AppDomain detected, which may allow manipulation of application domains.",
    ),
    (
        "System.Environment.Exit",
        "Usage of Environment.Exit detected, which may terminate the process.",
    ),
    (
        "Microsoft.Win32.Registry",
        "Usage of Registry detected, which may allow manipulation of the Windows registry.",
    ),
    (
        "System.ServiceProcess.ServiceController",
        "Usage of ServiceController detected, which may allow control of Windows services.",
    ),
    (
        "System.Net.Dns",
        "Usage of Dns detected, which may allow network name resolution.",
    ),
    (
        "System.Net.Sockets.Socket",
        "Usage of Socket detected, which may allow low-level network communication.",
    ),
    (
        "System.Net.WebRequest",
        "Usage of WebRequest detected, which may allow network communication.",
    ),
    (
        "System.Environment",
        "Usage of Environment class detected, which may expose system information or control.",
    ),
];

const DEFAULT_RESTRICTED_NAMESPACES: &[&str] = &[
    "System.Net",
    "System.IO",
    "System.Threading",
    "System.Reflection",
    "System.Diagnostics",
    "System.Activator",
];

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            dangerous_apis: DEFAULT_DANGEROUS_APIS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            restricted_namespaces: to_strings(DEFAULT_RESTRICTED_NAMESPACES),
            native_interop_attributes: to_strings(&["DllImport", "LibraryImport"]),
            process_type_markers: to_strings(&["Process"]),
            default_imports: to_strings(&[
                "System",
                "System.Collections.Generic",
                "System.Linq",
                "System.Text.Json",
            ]),
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn extend_unique(target: &mut Vec<String>, extra: Vec<String>) {
    for item in extra {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

impl SafetyPolicy {
    /// Merge another policy over this one. Entries of `other` win on key clashes.
    pub fn merge(&mut self, other: SafetyPolicy) {
        self.dangerous_apis.extend(other.dangerous_apis);
        extend_unique(&mut self.restricted_namespaces, other.restricted_namespaces);
        extend_unique(
            &mut self.native_interop_attributes,
            other.native_interop_attributes,
        );
        extend_unique(&mut self.process_type_markers, other.process_type_markers);
        extend_unique(&mut self.default_imports, other.default_imports);
    }

    /// Longest table key matching `name` exactly or as a member of it.
    pub fn lookup(&self, name: &str) -> Option<(&str, &str)> {
        self.dangerous_apis
            .iter()
            .filter(|(key, _)| is_same_or_member(name, key))
            .max_by_key(|(key, _)| key.len())
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether a namespace lies inside one of the restricted prefixes.
    pub fn is_restricted_namespace(&self, namespace: &str) -> bool {
        self.restricted_namespaces
            .iter()
            .any(|prefix| is_same_or_member(namespace, prefix))
    }

    /// Whether an attribute name (with or without its `Attribute` suffix) grants native interop.
    pub fn is_native_interop_attribute(&self, name: &str) -> bool {
        let short = name.rsplit('.').next().unwrap_or(name);
        let short = short.strip_suffix("Attribute").unwrap_or(short);
        self.native_interop_attributes.iter().any(|a| {
            let a = a.strip_suffix("Attribute").unwrap_or(a);
            a == short
        })
    }

    pub fn is_process_type(&self, type_name: &str) -> bool {
        self.process_type_markers
            .iter()
            .any(|marker| type_name.contains(marker.as_str()))
    }
}

/// `System.IO.File` is the same as or a member of `System.IO`, but `System.IOx` is not.
pub(crate) fn is_same_or_member(name: &str, prefix: &str) -> bool {
    name == prefix
        || (name.len() > prefix.len()
            && name.starts_with(prefix)
            && name.as_bytes()[prefix.len()] == b'.')
}
