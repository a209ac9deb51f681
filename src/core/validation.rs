/// Input constraint checks and the navigation gate they drive.

use regex::Regex;
use tracing::warn;

use crate::core::session::Session;
use crate::core::value::parse_number;
use crate::schema::output::{ElementId, Fragment, InputField, InputKind};

/// Whether an input satisfies its constraints. Disabled inputs always pass.
/// An empty value only fails when the input is required.
pub fn check_validity(input: &InputField) -> bool {
    if input.disabled {
        return true;
    }
    let constraints = &input.constraints;
    let value = input.value.as_str();
    if value.is_empty() {
        return !constraints.required;
    }

    let len = value.chars().count();
    if constraints.min_length.is_some_and(|min| len < min)
        || constraints.max_length.is_some_and(|max| len > max)
    {
        return false;
    }

    match input.kind {
        InputKind::Email if !is_email(value) => return false,
        InputKind::Number => {
            let Some(n) = parse_number(value) else {
                return false;
            };
            if constraints.min.is_some_and(|min| n < min) || constraints.max.is_some_and(|max| n > max) {
                return false;
            }
        }
        _ => {}
    }

    if let (Some(pattern), false) = (&constraints.pattern, input.kind == InputKind::TextArea) {
        match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(re) => return re.is_match(value),
            Err(err) => warn!(pattern = %pattern, %err, "input pattern is not a valid regex; ignoring it"),
        }
    }
    true
}

fn is_email(value: &str) -> bool {
    if value.contains(char::is_whitespace) {
        return false;
    }
    match value.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}

impl Session {
    /// Whether every enabled input in the current section is valid.
    pub fn are_inputs_valid(&self) -> bool {
        let mut valid = true;
        if let Some(section) = self.output.current() {
            section.for_each_fragment(&mut |fragment| {
                if let Fragment::Input(input) = fragment {
                    valid &= check_validity(input);
                }
            });
        }
        valid
    }

    /// Gate the current section's navigation links on input validity.
    pub(crate) fn update_link_states(&mut self) {
        let valid = self.are_inputs_valid();
        if let Some(section) = self.output.current_mut() {
            section.for_each_fragment_mut(&mut |fragment| {
                if let Fragment::Link(link) = fragment {
                    if link.kind.is_navigation() {
                        link.validation_disabled = !valid;
                    }
                }
            });
        }
    }

    pub(crate) fn mark_invalid_inputs(&mut self) {
        if let Some(section) = self.output.current_mut() {
            section.for_each_fragment_mut(&mut |fragment| {
                if let Fragment::Input(input) = fragment {
                    input.invalid = !check_validity(input);
                }
            });
        }
    }

    /// Type into an input. Returns false for unknown or disabled inputs.
    pub fn set_input_value(&mut self, id: ElementId, value: &str) -> bool {
        let Some(input) = self.output.input_mut(id) else {
            return false;
        };
        if input.disabled {
            return false;
        }
        input.value = value.to_string();
        if input.invalid && check_validity(input) {
            input.invalid = false;
        }
        self.update_link_states();
        self.save();
        self.flush_events();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::output::Constraints;

    fn field(kind: InputKind, value: &str, constraints: Constraints) -> InputField {
        InputField {
            id: None,
            attribute: "a".into(),
            kind,
            value: value.into(),
            constraints,
            disabled: false,
            invalid: false,
        }
    }

    #[test]
    fn required_and_empty() {
        let required = Constraints {
            required: true,
            ..Constraints::default()
        };
        assert!(!check_validity(&field(InputKind::Text, "", required.clone())));
        assert!(check_validity(&field(InputKind::Text, "x", required)));
        assert!(check_validity(&field(InputKind::Number, "", Constraints::default())));
    }

    #[test]
    fn lengths_count_characters() {
        let c = Constraints {
            min_length: Some(2),
            max_length: Some(3),
            ..Constraints::default()
        };
        assert!(check_validity(&field(InputKind::Text, "héé", c.clone())));
        assert!(!check_validity(&field(InputKind::Text, "h", c.clone())));
        assert!(!check_validity(&field(InputKind::Text, "hello", c)));
    }

    #[test]
    fn number_range() {
        let c = Constraints {
            min: Some(1.0),
            max: Some(10.0),
            ..Constraints::default()
        };
        assert!(check_validity(&field(InputKind::Number, "5", c.clone())));
        assert!(!check_validity(&field(InputKind::Number, "11", c.clone())));
        assert!(!check_validity(&field(InputKind::Number, "five", c)));
    }

    #[test]
    fn email_and_pattern() {
        assert!(check_validity(&field(InputKind::Email, "a@b.org", Constraints::default())));
        assert!(!check_validity(&field(InputKind::Email, "a@", Constraints::default())));
        let c = Constraints {
            pattern: Some("[a-z]+".into()),
            ..Constraints::default()
        };
        assert!(check_validity(&field(InputKind::Text, "abc", c.clone())));
        assert!(!check_validity(&field(InputKind::Text, "abc1", c)));
        let broken = Constraints {
            pattern: Some("(".into()),
            ..Constraints::default()
        };
        assert!(check_validity(&field(InputKind::Text, "anything", broken)));
    }

    #[test]
    fn disabled_inputs_pass() {
        let mut f = field(
            InputKind::Text,
            "",
            Constraints {
                required: true,
                ..Constraints::default()
            },
        );
        f.disabled = true;
        assert!(check_validity(&f));
    }
}
