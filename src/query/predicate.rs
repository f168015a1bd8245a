use std::collections::BTreeSet;
use std::fmt;

/// One column constrained to a finite set of acceptable values.
///
/// Values are held in their text form and compared against the text rendering
/// of each cell, so `1u64` and `"1"` select the same rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub column: String,
    pub values: BTreeSet<String>,
}

impl Predicate {
    pub fn new<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        Self {
            column: column.into(),
            values: values.into_iter().map(|v| v.to_string()).collect(),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {:?}", self.column, self.values)
    }
}

/// An ordered list of predicates combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicates(Vec<Predicate>);

impl Predicates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form: `Predicates::new().with("encounter_id", [1, 2])`.
    pub fn with<I, V>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        self.0.push(Predicate::new(column, values));
        self
    }

    pub fn push(&mut self, predicate: Predicate) {
        self.0.push(predicate);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Predicate> {
        self.0.iter()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|p| p.column.as_str())
    }

    /// Same predicates with each column passed through `f`.
    pub fn map_columns<F: Fn(&str) -> String>(&self, f: F) -> Self {
        self.0
            .iter()
            .map(|p| Predicate {
                column: f(&p.column),
                values: p.values.clone(),
            })
            .collect()
    }
}

impl FromIterator<Predicate> for Predicates {
    fn from_iter<T: IntoIterator<Item = Predicate>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Predicates {
    type Item = &'a Predicate;
    type IntoIter = std::slice::Iter<'a, Predicate>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Predicates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<all rows>");
        }
        for (i, p) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" AND ")?;
            }
            write!(f, "{}", p)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_order_and_stringifies() {
        let p = Predicates::new()
            .with("lab_component_name", ["CREATININE SERUM"])
            .with("encounter_id", [1u64, 2, 2]);
        assert_eq!(
            p.columns().collect::<Vec<_>>(),
            vec!["lab_component_name", "encounter_id"]
        );
        let ids: Vec<&str> = p.iter().nth(1).unwrap().values.iter().map(String::as_str).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(
            p.to_string(),
            "lab_component_name in {\"CREATININE SERUM\"} AND encounter_id in {\"1\", \"2\"}"
        );
    }

    #[test]
    fn map_columns_renames() {
        let p = Predicates::new().with("name", ["X"]);
        let raw = p.map_columns(|c| if c == "name" { "display_name".into() } else { c.into() });
        assert_eq!(raw.columns().collect::<Vec<_>>(), vec!["display_name"]);
    }
}
