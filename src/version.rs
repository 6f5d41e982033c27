use std::fmt::{Display, Formatter};

/// Version of a Go toolchain, parsed from strings like "go1.22.3".
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct GoVersion(pub (u32, u32, u32));

impl GoVersion {
    /// Parse a version from the `runtime.buildVersion` string found in a binary.
    pub fn parse(s: &str) -> Option<GoVersion> {
        let version = s.trim().strip_prefix("go")?;
        // strip release-candidate and beta suffixes ("1.23rc1" -> "1.23")
        let version = version
            .split(|c: char| c.is_ascii_alphabetic())
            .next()
            .unwrap_or(version);

        let mut parts = version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some(GoVersion((major, minor, patch)))
    }
}

impl Display for GoVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let GoVersion((major, minor, patch)) = self;
        f.write_fmt(format_args!("go{major}.{minor}.{patch}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_go_version_parse() {
        struct TestCase {
            string: &'static str,
            version: Option<GoVersion>,
        }
        let test_cases = [
            TestCase {
                string: "go1.22.3",
                version: Some(GoVersion((1, 22, 3))),
            },
            TestCase {
                string: "go1.21",
                version: Some(GoVersion((1, 21, 0))),
            },
            TestCase {
                string: "go1.23rc1",
                version: Some(GoVersion((1, 23, 0))),
            },
            TestCase {
                string: "devel +abcdef",
                version: None,
            },
        ];

        for tc in test_cases {
            assert_eq!(GoVersion::parse(tc.string), tc.version);
        }
    }
}
