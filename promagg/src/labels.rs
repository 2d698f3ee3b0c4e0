use std::fmt;

/// Label is a key/value pair of strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// `Labels` is a sorted set of `Label`s.
///
/// Together with the owning family's name it identifies one time series.
/// The derived `Ord` is the series order used everywhere: labels are
/// compared pairwise by `(name, value)`, and a label set that is a prefix
/// of a longer one sorts first.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Builds a label set, sorting by name. Pushers send labels in whatever
    /// order their client library produces, so sorting here is what makes
    /// the merge-join in [`crate::merge`] correct.
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: AsRef<str>,
    {
        let mut labels = labels
            .into_iter()
            .map(|(k, v)| Label {
                name: k.as_ref().to_owned(),
                value: v.as_ref().to_owned(),
            })
            .collect::<Vec<_>>();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        Self(labels)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the value of the label with given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by_key(&name, |label| label.name.as_str())
            .ok()
            .map(|index| self.0[index].value.as_str())
    }

    /// True if two labels share a name, which would make the set ambiguous.
    pub fn has_duplicate_names(&self) -> bool {
        self.0.windows(2).any(|w| w[0].name == w[1].name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    /// Fingerprint of this label set plus the implicit `__name__` label.
    /// Used to detect duplicate series within a single pushed family.
    pub fn signature_with_name(&self, metric_name: &str) -> Signature {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"__name__\xff");
        hasher.update(metric_name.as_bytes());
        hasher.update(b"\xff");
        for label in &self.0 {
            hasher.update(label.name.as_bytes());
            hasher.update(b"\xff");
            hasher.update(label.value.as_bytes());
            hasher.update(b"\xff");
        }
        Signature(hasher.finalize().into())
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Signature([u8; 32]);

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn test_labels_sorted_on_construction() {
        let labels = Labels::new([("b", "1"), ("a", "2"), ("c", "2")]);
        expect![[r#"
            Labels(
                [
                    Label {
                        name: "a",
                        value: "2",
                    },
                    Label {
                        name: "b",
                        value: "1",
                    },
                    Label {
                        name: "c",
                        value: "2",
                    },
                ],
            )
        "#]]
        .assert_debug_eq(&labels);
    }

    #[test]
    fn test_labels_order_by_name_then_value() {
        let a = Labels::new([("job", "a"), ("instance", "1")]);
        let b = Labels::new([("job", "b"), ("instance", "1")]);
        assert!(a < b);

        let c = Labels::new([("instance", "1")]);
        let d = Labels::new([("instance", "2")]);
        assert!(c < d);
    }

    #[test]
    fn test_labels_prefix_sorts_first() {
        let short = Labels::new([("a", "1")]);
        let long = Labels::new([("a", "1"), ("b", "2")]);
        assert!(short < long);
        assert!(Labels::default() < short);
    }

    #[test]
    fn test_labels_order_ignores_wire_order() {
        let a = Labels::new([("a", "a"), ("b", "b")]);
        let b = Labels::new([("b", "b"), ("a", "a")]);
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_labels_get() {
        let labels = Labels::new([("a", "1"), ("b", "2")]);
        assert_eq!(labels.get("b"), Some("2"));
        assert!(labels.get("x").is_none());
    }

    #[test]
    fn test_labels_duplicate_names() {
        let labels = Labels::new([("a", "1"), ("a", "2")]);
        assert!(labels.has_duplicate_names());
        assert!(!Labels::new([("a", "1"), ("b", "2")]).has_duplicate_names());
    }

    #[test]
    fn test_signature_includes_metric_name() {
        let labels = Labels::new([("loaded", "true")]);
        assert_ne!(
            labels.signature_with_name("cats"),
            labels.signature_with_name("dogs")
        );
        assert_eq!(
            labels.signature_with_name("cats"),
            Labels::new([("loaded", "true")]).signature_with_name("cats")
        );
    }

    #[test]
    fn test_signature_no_field_ambiguity() {
        // "ab"="c" and "a"="bc" must not collide
        let a = Labels::new([("ab", "c")]);
        let b = Labels::new([("a", "bc")]);
        assert_ne!(a.signature_with_name("m"), b.signature_with_name("m"));
    }

    #[test]
    fn test_labels_display() {
        let labels = Labels::new([("b", "with \"quotes\""), ("a", "1")]);
        assert_eq!(labels.to_string(), r#"{a="1",b="with \"quotes\""}"#);
    }
}
