//! Argument-vector templates.
//!
//! A template is a list of strings: the program followed by its arguments.
//! Arguments may contain `{name}` placeholders; `{{` and `}}` are literal
//! braces. Rendering substitutes validated values element by element, so a
//! value always lands inside exactly one argv element and is never re-parsed
//! by a shell.

use std::collections::HashMap;

use crate::param::{ParamValue, is_identifier};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(String),
}

/// One argv element of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ArgTemplate {
    segments: Vec<Segment>,
}

impl ArgTemplate {
    fn parse(raw: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for n in chars.by_ref() {
                        if n == '}' {
                            closed = true;
                            break;
                        }
                        name.push(n);
                    }
                    if !closed {
                        return Err(format!("unterminated placeholder in '{raw}'"));
                    }
                    if !is_identifier(&name) {
                        return Err(format!("invalid placeholder '{{{name}}}' in '{raw}'"));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Slot(name));
                }
                '}' => return Err(format!("unmatched '}}' in '{raw}'")),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    fn slots(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Slot(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Render this element, or `None` if any referenced value is absent.
    fn render(&self, values: &HashMap<String, ParamValue>) -> Option<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(name) => out.push_str(&values.get(name)?.to_string()),
            }
        }
        Some(out)
    }
}

/// A parsed command template: literal program plus argument templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: String,
    args: Vec<ArgTemplate>,
}

impl CommandTemplate {
    /// Parse a template from its argv form.
    ///
    /// # Errors
    ///
    /// Returns a reason string if the template is empty, the program contains
    /// a placeholder, or any element has malformed placeholder syntax.
    pub fn parse<S: AsRef<str>>(argv: &[S]) -> Result<Self, String> {
        let Some((program, rest)) = argv.split_first() else {
            return Err("command template is empty".to_owned());
        };

        let program = ArgTemplate::parse(program.as_ref())?;
        if program.slots().next().is_some() {
            return Err("the program may not contain a placeholder".to_owned());
        }
        let program = program
            .render(&HashMap::new())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| "the program may not be empty".to_owned())?;

        let args = rest
            .iter()
            .map(|a| ArgTemplate::parse(a.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { program, args })
    }

    /// The executable (path or name looked up on `PATH`).
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Every placeholder name referenced by the arguments, in order, with repeats.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.args.iter().flat_map(ArgTemplate::slots)
    }

    /// Substitute values into the arguments.
    ///
    /// An element that references a parameter missing from `values` is
    /// dropped as a whole, so optional flags disappear cleanly.
    pub fn render_args(&self, values: &HashMap<String, ParamValue>) -> Vec<String> {
        self.args.iter().filter_map(|a| a.render(values)).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, ParamValue)]) -> HashMap<String, ParamValue> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn whole_element_substitution() {
        let t = CommandTemplate::parse(&["/bin/echo", "{msg}"]).unwrap();
        assert_eq!(t.program(), "/bin/echo");
        let args = t.render_args(&values(&[("msg", ParamValue::Text("hello".into()))]));
        assert_eq!(args, vec!["hello"]);
    }

    #[test]
    fn value_with_spaces_stays_one_element() {
        let t = CommandTemplate::parse(&["printf", "%s", "{msg}"]).unwrap();
        let args = t.render_args(&values(&[("msg", ParamValue::Text("a b; c".into()))]));
        assert_eq!(args, vec!["%s", "a b; c"]);
    }

    #[test]
    fn embedded_placeholder_and_integer() {
        let t = CommandTemplate::parse(&["docker", "logs", "--tail={lines}", "web"]).unwrap();
        let args = t.render_args(&values(&[("lines", ParamValue::Integer(20))]));
        assert_eq!(args, vec!["logs", "--tail=20", "web"]);
    }

    #[test]
    fn missing_value_drops_element() {
        let t = CommandTemplate::parse(&["docker", "logs", "--tail={lines}", "web"]).unwrap();
        assert_eq!(t.render_args(&HashMap::new()), vec!["logs", "web"]);
    }

    #[test]
    fn escaped_braces_are_literal() {
        let t = CommandTemplate::parse(&["fmt", "{{{name}}}", "}}"]).unwrap();
        let args = t.render_args(&values(&[("name", ParamValue::Text("x".into()))]));
        assert_eq!(args, vec!["{x}", "}"]);
    }

    #[test]
    fn placeholders_listed_in_order() {
        let t = CommandTemplate::parse(&["p", "{a}-{b}", "{a}"]).unwrap();
        let names: Vec<_> = t.placeholders().collect();
        assert_eq!(names, vec!["a", "b", "a"]);
    }

    #[test]
    fn rejects_malformed_templates() {
        let empty: [&str; 0] = [];
        assert!(CommandTemplate::parse(&empty).is_err());
        assert!(CommandTemplate::parse(&["{bin}", "x"]).is_err());
        assert!(CommandTemplate::parse(&[""]).is_err());
        assert!(CommandTemplate::parse(&["p", "{unterminated"]).is_err());
        assert!(CommandTemplate::parse(&["p", "{bad-name}"]).is_err());
        assert!(CommandTemplate::parse(&["p", "{}"]).is_err());
        assert!(CommandTemplate::parse(&["p", "stray}"]).is_err());
    }
}
