//! C function signatures expected from submissions.
//!
//! A signature is parsed from a prototype such as `int multiplyByTwo(int x)`
//! and rendered back into the forward declaration that is prepended to the
//! learner's translation unit.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static PROTOTYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<ret>(?:[A-Za-z_]\w*[\s\*]+)+?)(?P<name>[A-Za-z_]\w*)\s*\((?P<params>[^()]*)\)$")
        .expect("prototype pattern is valid")
});

/// Identifiers that can end a parameter type and must not be read as its name.
const TYPE_WORDS: &[&str] = &[
    "void", "char", "short", "int", "long", "float", "double", "signed", "unsigned", "bool",
    "_Bool", "size_t", "const", "volatile",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("not a function prototype: {0}")]
    Malformed(String),
}

/// One parameter of a function prototype
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter type, array dimensions included (`int[]`)
    pub ty: String,
    /// Parameter name, when the prototype gives one
    pub name: Option<String>,
}

/// Expected function signature of an exercise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub return_type: String,
    pub name: String,
    pub params: Vec<Parameter>,
}

impl FunctionSignature {
    /// Forward declaration, terminated by `;`.
    pub fn declaration(&self) -> String {
        format!("{};", self)
    }

    /// Whether `source` mentions a call or definition of this function.
    pub fn is_referenced_in(&self, source: &str) -> bool {
        let pattern = format!(r"\b{}\s*\(", regex::escape(&self.name));
        Regex::new(&pattern)
            .map(|re| re.is_match(source))
            .unwrap_or(false)
    }

    /// Find the first top-level prototype (other than `main`) in a C source.
    ///
    /// Used to recover the expected signature from a reference harness that
    /// forward-declares the learner's function.
    pub fn extract_from_source(source: &str) -> Option<Self> {
        let mut depth: i32 = 0;

        for line in source.lines() {
            let trimmed = line.trim();
            let at_top_level = depth == 0;
            depth += trimmed.matches('{').count() as i32;
            depth -= trimmed.matches('}').count() as i32;

            if !at_top_level || trimmed.starts_with('#') || !trimmed.ends_with(");") {
                continue;
            }

            let candidate = trimmed.strip_prefix("extern ").unwrap_or(trimmed);
            if let Ok(signature) = candidate.parse::<FunctionSignature>() {
                if signature.name != "main" {
                    return Some(signature);
                }
            }
        }

        None
    }
}

impl FromStr for FunctionSignature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().trim_end_matches(';').trim();
        let caps = PROTOTYPE
            .captures(text)
            .ok_or_else(|| SignatureError::Malformed(s.to_string()))?;

        let return_type = normalize_type(&caps["ret"]);
        let params_text = normalize_type(&caps["params"]);

        let params = if params_text.is_empty() || params_text == "void" {
            Vec::new()
        } else {
            params_text
                .split(',')
                .map(parse_parameter)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| SignatureError::Malformed(s.to_string()))?
        };

        Ok(Self {
            return_type,
            name: caps["name"].to_string(),
            params,
        })
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = if self.params.is_empty() {
            "void".to_string()
        } else {
            self.params
                .iter()
                .map(Parameter::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "{}({})", join_declarator(&self.return_type, &self.name), params)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            None => write!(f, "{}", self.ty),
            Some(name) => match self.ty.find('[') {
                Some(idx) => {
                    let (base, dims) = self.ty.split_at(idx);
                    write!(f, "{}{}", join_declarator(base, name), dims)
                }
                None => write!(f, "{}", join_declarator(&self.ty, name)),
            },
        }
    }
}

/// `int` + `x` -> `int x`, `char *` + `s` -> `char *s`
fn join_declarator(ty: &str, name: &str) -> String {
    if ty.ends_with('*') {
        format!("{ty}{name}")
    } else {
        format!("{ty} {name}")
    }
}

/// Collapse whitespace and write pointers as `char *`.
fn normalize_type(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let tight = collapsed.replace(" *", "*").replace("* ", "*");
    let tight = tight.replace(" ,", ",").replace(", ", ",");
    match tight.find('*') {
        Some(idx) if !tight.contains(',') => {
            format!("{} {}", tight[..idx].trim_end(), &tight[idx..])
        }
        _ => tight,
    }
}

fn parse_parameter(raw: &str) -> Result<Parameter, SignatureError> {
    let text = normalize_type(raw);
    if text.is_empty() {
        return Err(SignatureError::Malformed(raw.to_string()));
    }

    let (base, dims) = match text.find('[') {
        Some(idx) => (text[..idx].trim().to_string(), text[idx..].replace(' ', "")),
        None => (text.clone(), String::new()),
    };

    let split = base
        .char_indices()
        .rev()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map(|(idx, _)| idx);

    let (ty, name) = match split {
        Some(idx) => {
            let candidate = &base[idx + 1..];
            let prefix = base[..=idx].trim();
            if !candidate.is_empty() && !prefix.is_empty() && !TYPE_WORDS.contains(&candidate) {
                (normalize_type(prefix), Some(candidate.to_string()))
            } else {
                (base.clone(), None)
            }
        }
        None => (base.clone(), None),
    };

    Ok(Parameter {
        ty: format!("{ty}{dims}"),
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_prototype() {
        let sig: FunctionSignature = "int multiplyByTwo(int x)".parse().unwrap();
        assert_eq!(sig.return_type, "int");
        assert_eq!(sig.name, "multiplyByTwo");
        assert_eq!(
            sig.params,
            vec![Parameter { ty: "int".into(), name: Some("x".into()) }]
        );
        assert_eq!(sig.declaration(), "int multiplyByTwo(int x);");
    }

    #[test]
    fn test_parse_pointers_and_unnamed_params() {
        let sig: FunctionSignature = "char *  dup( const char*s , unsigned int );".parse().unwrap();
        assert_eq!(sig.return_type, "char *");
        assert_eq!(sig.params[0].ty, "const char *");
        assert_eq!(sig.params[0].name.as_deref(), Some("s"));
        assert_eq!(sig.params[1].ty, "unsigned int");
        assert_eq!(sig.params[1].name, None);
        assert_eq!(sig.to_string(), "char *dup(const char *s, unsigned int)");
    }

    #[test]
    fn test_parse_arrays_and_void() {
        let sig: FunctionSignature = "long sum(int values[], int n)".parse().unwrap();
        assert_eq!(sig.params[0].ty, "int[]");
        assert_eq!(sig.to_string(), "long sum(int values[], int n)");

        let sig: FunctionSignature = "void reset(void)".parse().unwrap();
        assert!(sig.params.is_empty());
        assert_eq!(sig.declaration(), "void reset(void);");
    }

    #[test]
    fn test_reject_non_prototypes() {
        assert!("printf(\"hi\")".parse::<FunctionSignature>().is_err());
        assert!("int x = 3;".parse::<FunctionSignature>().is_err());
    }

    #[test]
    fn test_extract_from_harness() {
        let harness = r#"#include <stdio.h>
#include <assert.h>

int multiplyByThree(int x);

int main()
{
    assert(multiplyByThree(2) == 6);
    printf("All tests passed!\n");
    return 0;
}"#;
        let sig = FunctionSignature::extract_from_source(harness).unwrap();
        assert_eq!(sig.name, "multiplyByThree");
    }

    #[test]
    fn test_extract_ignores_calls_inside_bodies() {
        let harness = "int main(void)\n{\n    helper(3);\n    return 0;\n}\n";
        assert!(FunctionSignature::extract_from_source(harness).is_none());
    }

    #[test]
    fn test_is_referenced_in() {
        let sig: FunctionSignature = "int multiplyByTwo(int x)".parse().unwrap();
        assert!(sig.is_referenced_in("int multiplyByTwo (int x){return x*2;}"));
        assert!(!sig.is_referenced_in("int multiplyByTwos(int x){return x*2;}"));
    }
}
