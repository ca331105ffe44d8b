//! Static safety gate for submitted source.

pub mod lexer;
pub mod policy;
pub mod walker;

pub use policy::SafetyPolicy;
pub use walker::SafetyAnalyzer;
