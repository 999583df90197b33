//! Invocation plan codec.
//!
//! A plan is the triple (environment, executable, parameters) persisted in a
//! service's `if/invocation.txt`. The encoding is line-oriented UTF-8 with
//! three sections introduced by literal tags:
//!
//! ```text
//! [environment]
//! NAME=value
//! NAME
//! [executable]
//! /usr/bin/env
//! [parameters]
//! env
//! ```
//!
//! An environment line without `=` unsets the variable. The first parameter
//! is the argv element the child sees as its own name.

use crate::error::PlanError;

/// One environment directive: a `None` value unsets the variable.
pub type EnvEntry = (String, Option<String>);

const TAG_ENVIRONMENT: &str = "[environment]";
const TAG_EXECUTABLE: &str = "[executable]";
const TAG_PARAMETERS: &str = "[parameters]";

/// The persisted launch definition of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationPlan {
    /// Ordered environment overlay applied on top of the supervisor's own.
    pub environment: Vec<EnvEntry>,
    /// Path of the program to execute. `None` means the service is not
    /// launchable yet.
    pub executable: Option<String>,
    /// Full argv, including the leading program name.
    pub parameters: Vec<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Environment,
    Executable,
    Parameters,
}

impl InvocationPlan {
    /// Whether the plan carries nothing to execute and nothing to set.
    pub fn is_empty(&self) -> bool {
        self.environment.is_empty()
            && self.executable.is_none()
            && self.parameters.is_empty()
    }

    /// Parses the text form. Empty input yields the empty plan.
    pub fn parse(text: &str) -> Result<Self, PlanError> {
        let mut plan = InvocationPlan::default();
        let mut section = None;
        let mut seen: Vec<&str> = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let lineno = index + 1;
            let line = raw.strip_suffix('\r').unwrap_or(raw);

            if let Some(tag) = recognize_tag(line) {
                if seen.contains(&tag) {
                    return Err(PlanError::DuplicateSection(lineno, tag.to_string()));
                }
                seen.push(tag);
                section = Some(match tag {
                    TAG_ENVIRONMENT => Section::Environment,
                    TAG_EXECUTABLE => Section::Executable,
                    _ => Section::Parameters,
                });
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                return Err(PlanError::UnknownSection(lineno, line.to_string()));
            }

            match section {
                None => {
                    if line.is_empty() {
                        continue;
                    }
                    return Err(PlanError::ContentBeforeSection(lineno));
                }
                Some(Section::Environment) => {
                    let entry = match line.split_once('=') {
                        Some((name, value)) => (name.to_string(), Some(value.to_string())),
                        None => (line.to_string(), None),
                    };
                    if entry.0.is_empty() {
                        return Err(PlanError::EmptyEnvironmentName(lineno));
                    }
                    plan.environment.push(entry);
                }
                Some(Section::Executable) => {
                    if plan.executable.is_some() {
                        return Err(PlanError::ExcessExecutable(lineno));
                    }
                    if !line.is_empty() {
                        plan.executable = Some(line.to_string());
                    }
                }
                Some(Section::Parameters) => {
                    plan.parameters.push(line.to_string());
                }
            }
        }

        Ok(plan)
    }

    /// Serializes to the text form, newline-terminated.
    pub fn serialize(&self) -> Result<String, PlanError> {
        let mut out = String::new();

        out.push_str(TAG_ENVIRONMENT);
        out.push('\n');
        for (name, value) in &self.environment {
            if name.is_empty() || name.contains('=') {
                return Err(PlanError::EmptyEnvironmentName(0));
            }
            match value {
                Some(value) => {
                    // The '=' keeps a set entry from ever reading as a tag.
                    check_line(name)?;
                    check_line(value)?;
                    out.push_str(name);
                    out.push('=');
                    out.push_str(value);
                }
                None => {
                    check_field(name)?;
                    out.push_str(name);
                }
            }
            out.push('\n');
        }

        out.push_str(TAG_EXECUTABLE);
        out.push('\n');
        if let Some(executable) = self.executable.as_deref() {
            check_field(executable)?;
            out.push_str(executable);
            out.push('\n');
        }

        out.push_str(TAG_PARAMETERS);
        out.push('\n');
        for parameter in &self.parameters {
            check_field(parameter)?;
            out.push_str(parameter);
            out.push('\n');
        }

        Ok(out)
    }
}

fn recognize_tag(line: &str) -> Option<&'static str> {
    match line {
        TAG_ENVIRONMENT => Some(TAG_ENVIRONMENT),
        TAG_EXECUTABLE => Some(TAG_EXECUTABLE),
        TAG_PARAMETERS => Some(TAG_PARAMETERS),
        _ => None,
    }
}

fn check_line(text: &str) -> Result<(), PlanError> {
    if text.contains('\n') {
        return Err(PlanError::EmbeddedNewline);
    }
    Ok(())
}

// Fields that would read back as a section tag are unrepresentable.
fn check_field(text: &str) -> Result<(), PlanError> {
    check_line(text)?;
    if recognize_tag(text).is_some() {
        return Err(PlanError::ReservedLine(text.to_string()));
    }
    Ok(())
}
