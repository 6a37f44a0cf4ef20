use serde::{Deserialize, Serialize};

use crate::SharedStr;

/// Fully qualified name of an instrumented method.
///
/// Class- and package-level views reuse this type with an empty `method`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodName {
    pub class: SharedStr,
    pub method: SharedStr,
    pub signature: SharedStr,
}

impl MethodName {
    pub fn new(
        class: impl Into<SharedStr>,
        method: impl Into<SharedStr>,
        signature: impl Into<SharedStr>,
    ) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
            signature: signature.into(),
        }
    }

    /// A class- or package-level entry.
    pub fn owner(name: impl Into<SharedStr>) -> Self {
        Self::new(name, "", "")
    }

    /// An empty entry that only pads the table up to a higher id.
    pub fn is_placeholder(&self) -> bool {
        self.class.is_empty() && self.method.is_empty() && self.signature.is_empty()
    }

    /// `class.method`, or just `class` for owner-level entries. Filters match
    /// against this form.
    pub fn display_name(&self) -> String {
        if self.method.is_empty() {
            self.class.to_string()
        } else {
            format!("{}.{}", self.class, self.method)
        }
    }

    /// `class.method(signature)`, as shown in exported rows.
    pub fn full_name(&self) -> String {
        if self.signature.is_empty() {
            self.display_name()
        } else {
            format!("{}{}", self.display_name(), self.signature)
        }
    }

    /// Package part of the class name; `<default>` for the unnamed package.
    pub fn package(&self) -> &str {
        match self.class.rfind('.') {
            Some(pos) => &self.class[..pos],
            None => "<default>",
        }
    }
}

impl std::fmt::Display for MethodName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        let m = MethodName::new("com.acme.Parser", "parse", "(Ljava/lang/String;)V");
        assert_eq!(m.display_name(), "com.acme.Parser.parse");
        assert_eq!(m.full_name(), "com.acme.Parser.parse(Ljava/lang/String;)V");
        assert_eq!(MethodName::owner("com.acme").display_name(), "com.acme");
    }

    #[test]
    fn package_of_class() {
        assert_eq!(MethodName::new("com.acme.Parser", "p", "").package(), "com.acme");
        assert_eq!(MethodName::new("Main", "main", "").package(), "<default>");
    }
}
