use crate::model::{ErrorCategory, ExecutionOutput, OutputKind, META_CATEGORY};

/// What the governor lets through of one write.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<'a> {
    /// The whole chunk fits.
    Accepted(&'a str),
    /// The chunk crossed the ceiling; only this prefix fits and the quota is now spent.
    Truncated(&'a str),
    /// The quota was already spent.
    Rejected,
}

/// Cumulative output ceiling of one execution, in UTF-8 bytes.
#[derive(Debug, Clone)]
pub struct OutputQuota {
    max: usize,
    used: usize,
    exhausted: bool,
}

impl OutputQuota {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            used: 0,
            exhausted: false,
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn admit<'a>(&mut self, chunk: &'a str) -> Admission<'a> {
        if self.exhausted {
            return Admission::Rejected;
        }
        if self.used + chunk.len() <= self.max {
            self.used += chunk.len();
            return Admission::Accepted(chunk);
        }

        let mut cut = self.max - self.used;
        while !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.used += cut;
        self.exhausted = true;
        Admission::Truncated(&chunk[..cut])
    }

    /// Reserve `extra` bytes for content that grew after admission.
    /// Nothing is reserved when they do not fit.
    pub fn charge(&mut self, extra: usize) -> bool {
        if self.used + extra > self.max {
            return false;
        }
        self.used += extra;
        true
    }

    /// The single terminal notice emitted when the ceiling is hit.
    pub fn notice(&self) -> ExecutionOutput {
        ExecutionOutput::new(
            OutputKind::Text,
            format!("Output limit of {}KB reached. Output truncated.", self.max / 1024),
        )
        .with_metadata(META_CATEGORY, ErrorCategory::QuotaExceeded.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_until_ceiling() {
        let mut quota = OutputQuota::new(10);
        assert_eq!(quota.admit("hello"), Admission::Accepted("hello"));
        assert_eq!(quota.admit("world"), Admission::Accepted("world"));
        assert_eq!(quota.used(), 10);
        assert!(!quota.is_exhausted());
        assert_eq!(quota.admit("!"), Admission::Truncated(""));
        assert_eq!(quota.admit("more"), Admission::Rejected);
    }

    #[test]
    fn test_truncates_on_char_boundary() {
        let mut quota = OutputQuota::new(4);
        // "aé" is 3 bytes, "éé" would need 4 more
        assert_eq!(quota.admit("aé"), Admission::Accepted("aé"));
        assert_eq!(quota.admit("éé"), Admission::Truncated(""));
        assert_eq!(quota.used(), 3);
    }

    #[test]
    fn test_charge_respects_ceiling() {
        let mut quota = OutputQuota::new(10);
        assert_eq!(quota.admit("abcd"), Admission::Accepted("abcd"));
        assert!(quota.charge(6));
        assert!(!quota.charge(1));
        assert_eq!(quota.used(), 10);
        assert_eq!(quota.admit("x"), Admission::Truncated(""));
    }

    #[test]
    fn test_notice() {
        let quota = OutputQuota::new(1024 * 1024);
        let notice = quota.notice();
        assert_eq!(notice.content, "Output limit of 1024KB reached. Output truncated.");
        assert_eq!(notice.category(), Some("quota-exceeded"));
    }
}
