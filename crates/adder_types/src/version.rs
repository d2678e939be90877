//! Ordering of package version strings.
//!
//! Versions are compared segment by segment after splitting on `.`, `-` and
//! `_`. Each segment is broken into numeric and alphabetic atoms; alphabetic
//! atoms sort before numbers (`1.0a < 1.0`), the literal `dev` sorts before
//! everything and `post` after everything. Missing trailing segments compare
//! equal to zero, so `1.0 == 1.0.0`. An optional numeric epoch can be given
//! with `!`, as in `1!0.5`.

use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Atom {
    Dev,
    Text(String),
    Number(u64),
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    epoch: u64,
    segments: Vec<Vec<Atom>>,
}

impl Version {
    /// Parse a version string. Parsing is lenient; anything unrecognized
    /// degrades to a textual atom rather than failing.
    pub fn parse(version: &str) -> Version {
        let version = version.trim().to_ascii_lowercase();
        let (epoch, rest) = match version.split_once('!') {
            Some((epoch, rest)) => (epoch.parse().unwrap_or(0), rest),
            None => (0, version.as_str()),
        };

        let mut segments: Vec<Vec<Atom>> = rest
            .split(['.', '-', '_'])
            .map(|segment| {
                let atoms = split_atoms(segment);
                if atoms.is_empty() {
                    vec![Atom::Number(0)]
                } else {
                    atoms
                }
            })
            .collect();
        if segments.is_empty() {
            segments.push(vec![Atom::Number(0)]);
        }
        Version { epoch, segments }
    }
}

fn split_atoms(segment: &str) -> Vec<Atom> {
    let mut atoms = Vec::new();
    let mut rest = segment;
    while !rest.is_empty() {
        let numeric = rest.chars().next().is_some_and(|c| c.is_ascii_digit());
        let end = rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() != numeric)
            .map_or(rest.len(), |(i, _)| i);
        let (run, tail) = rest.split_at(end);
        atoms.push(if numeric {
            Atom::Number(run.parse().unwrap_or(u64::MAX))
        } else {
            match run {
                "dev" => Atom::Dev,
                "post" => Atom::Post,
                _ => Atom::Text(run.to_string()),
            }
        });
        rest = tail;
    }
    atoms
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch.cmp(&other.epoch).then_with(|| {
            let len = self.segments.len().max(other.segments.len());
            let zero = vec![Atom::Number(0)];
            for i in 0..len {
                let a = self.segments.get(i).unwrap_or(&zero);
                let b = other.segments.get(i).unwrap_or(&zero);
                let ordering = cmp_segment(a, b);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn cmp_segment(a: &[Atom], b: &[Atom]) -> Ordering {
    let zero = Atom::Number(0);
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).unwrap_or(&zero);
        let y = b.get(i).unwrap_or(&zero);
        let ordering = x.cmp(y);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Compare two version strings.
pub fn compare(a: &str, b: &str) -> Ordering {
    Version::parse(a).cmp(&Version::parse(b))
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;

    use rstest::rstest;

    use super::compare;

    #[rstest]
    #[case("1.0", "1.1")]
    #[case("1.0", "1.0.1")]
    #[case("1.9", "1.10")]
    #[case("2.0a0", "2.0")]
    #[case("2.0a1", "2.0b1")]
    #[case("1.0.dev1", "1.0")]
    #[case("1.0a1", "1.0.dev1")]
    #[case("1.0", "1.0.post1")]
    #[case("0.9", "1!0.5")]
    #[case("1.0rc1", "1.0rc2")]
    fn orders_less(#[case] lower: &str, #[case] higher: &str) {
        assert_eq!(compare(lower, higher), Ordering::Less);
        assert_eq!(compare(higher, lower), Ordering::Greater);
    }

    #[rstest]
    #[case("1.0", "1.0.0")]
    #[case("1.0", "1_0")]
    #[case("1.0", "1.0")]
    #[case("1.0A", "1.0a")]
    fn orders_equal(#[case] a: &str, #[case] b: &str) {
        assert_eq!(compare(a, b), Ordering::Equal);
    }
}
