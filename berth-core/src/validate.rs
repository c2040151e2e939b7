//! Operation request validation.
//!
//! Requests arrive from the orchestrator as a verb plus free-form option and
//! service lists. The verb set is closed, every flag is whitelisted per verb,
//! value-taking flags have their values whitelisted, and every token that
//! could reach an engine argv is screened for shell metacharacters. Nothing
//! here has side effects; a request that fails validation never spawns
//! anything.

use crate::vault::RegistryCredential;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Characters that must never appear in an argument handed to the engine
/// CLI, even though arguments are passed as discrete argv elements.
const FORBIDDEN_CHARS: &[char] = &[
    ';', '&', '|', '$', '`', '(', ')', '{', '}', '<', '>', '\\', '\'', '"', '\n', '\r', '\t',
];

static SERVICE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("service name pattern"));

static SCALE_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*=\d+$").expect("scale pattern"));

static DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("digits pattern"));

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("unknown operation: {0:?}")]
    UnknownVerb(String),

    #[error("option {option:?} is not allowed for {verb}")]
    UnknownOption { verb: OperationVerb, option: String },

    #[error("option {0:?} requires a value")]
    MissingValue(String),

    #[error("invalid value {value:?} for option {option:?}")]
    InvalidValue { option: String, value: String },

    #[error("argument {0:?} contains forbidden characters")]
    ForbiddenCharacters(String),

    #[error("invalid service name: {0:?}")]
    InvalidServiceName(String),

    #[error("registry credential is missing {0}")]
    IncompleteCredential(&'static str),
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownVerb(_) => "unknown-operation",
            Self::UnknownOption { .. } => "unknown-option",
            Self::MissingValue(_) | Self::InvalidValue { .. } => "invalid-option-value",
            Self::ForbiddenCharacters(_) => "forbidden-characters",
            Self::InvalidServiceName(_) => "invalid-service-name",
            Self::IncompleteCredential(_) => "invalid-credential",
        }
    }
}

/// The closed set of operations the agent will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationVerb {
    Up,
    Down,
    Start,
    Stop,
    Restart,
    Pull,
    CreateArchive,
    ExtractArchive,
}

impl OperationVerb {
    pub fn parse(verb: &str) -> Result<Self, ValidationError> {
        match verb {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "pull" => Ok(Self::Pull),
            "create-archive" => Ok(Self::CreateArchive),
            "extract-archive" => Ok(Self::ExtractArchive),
            other => Err(ValidationError::UnknownVerb(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Pull => "pull",
            Self::CreateArchive => "create-archive",
            Self::ExtractArchive => "extract-archive",
        }
    }

    /// Archive verbs run in-process instead of through the engine CLI.
    pub fn is_archive(&self) -> bool {
        matches!(self, Self::CreateArchive | Self::ExtractArchive)
    }
}

impl fmt::Display for OperationVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated-shape operation request as received from the orchestrator.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationRequest {
    pub command: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default, rename = "registry_credentials")]
    pub credentials: Vec<RegistryCredential>,
}

impl OperationRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            options: Vec::new(),
            services: Vec::new(),
            credentials: Vec::new(),
        }
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }
}

enum ValueRule {
    /// Flag takes no value.
    None,
    /// Value must be one of the listed literals.
    OneOf(&'static [&'static str]),
    /// Value must be decimal digits.
    Digits,
    /// Value must match `service=N`.
    Scale,
    /// Any value, still subject to the metacharacter screen.
    Free,
}

struct FlagSpec {
    names: &'static [&'static str],
    value: ValueRule,
}

const UP_FLAGS: &[FlagSpec] = &[
    FlagSpec { names: &["-d", "--detach"], value: ValueRule::None },
    FlagSpec { names: &["--build"], value: ValueRule::None },
    FlagSpec { names: &["--no-build"], value: ValueRule::None },
    FlagSpec { names: &["--force-recreate"], value: ValueRule::None },
    FlagSpec { names: &["--no-recreate"], value: ValueRule::None },
    FlagSpec { names: &["--no-deps"], value: ValueRule::None },
    FlagSpec { names: &["--remove-orphans"], value: ValueRule::None },
    FlagSpec { names: &["--quiet-pull"], value: ValueRule::None },
    FlagSpec { names: &["--wait"], value: ValueRule::None },
    FlagSpec {
        names: &["--pull"],
        value: ValueRule::OneOf(&["always", "missing", "never"]),
    },
    FlagSpec { names: &["-t", "--timeout"], value: ValueRule::Digits },
    FlagSpec { names: &["--wait-timeout"], value: ValueRule::Digits },
    FlagSpec { names: &["--scale"], value: ValueRule::Scale },
];

const DOWN_FLAGS: &[FlagSpec] = &[
    FlagSpec { names: &["--remove-orphans"], value: ValueRule::None },
    FlagSpec { names: &["-v", "--volumes"], value: ValueRule::None },
    FlagSpec {
        names: &["--rmi"],
        value: ValueRule::OneOf(&["local", "all"]),
    },
    FlagSpec { names: &["-t", "--timeout"], value: ValueRule::Digits },
];

const START_FLAGS: &[FlagSpec] = &[];

const STOP_FLAGS: &[FlagSpec] = &[
    FlagSpec { names: &["-t", "--timeout"], value: ValueRule::Digits },
];

const RESTART_FLAGS: &[FlagSpec] = &[
    FlagSpec { names: &["-t", "--timeout"], value: ValueRule::Digits },
    FlagSpec { names: &["--no-deps"], value: ValueRule::None },
];

const PULL_FLAGS: &[FlagSpec] = &[
    FlagSpec { names: &["--ignore-pull-failures"], value: ValueRule::None },
    FlagSpec { names: &["--include-deps"], value: ValueRule::None },
    FlagSpec { names: &["-q", "--quiet"], value: ValueRule::None },
    FlagSpec {
        names: &["--policy"],
        value: ValueRule::OneOf(&["missing", "always"]),
    },
];

const ARCHIVE_FLAGS: &[FlagSpec] = &[
    FlagSpec {
        names: &["--format"],
        value: ValueRule::OneOf(&["zip", "tar", "tar.gz"]),
    },
    FlagSpec {
        names: &["--compression"],
        value: ValueRule::OneOf(&["gzip", "none"]),
    },
    FlagSpec { names: &["--output"], value: ValueRule::Free },
    FlagSpec { names: &["--include"], value: ValueRule::Free },
    FlagSpec { names: &["--exclude"], value: ValueRule::Free },
    FlagSpec { names: &["--archive"], value: ValueRule::Free },
    FlagSpec { names: &["--destination"], value: ValueRule::Free },
    FlagSpec { names: &["--overwrite"], value: ValueRule::None },
    FlagSpec { names: &["--create-dirs"], value: ValueRule::None },
];

fn flags_for(verb: OperationVerb) -> &'static [FlagSpec] {
    match verb {
        OperationVerb::Up => UP_FLAGS,
        OperationVerb::Down => DOWN_FLAGS,
        OperationVerb::Start => START_FLAGS,
        OperationVerb::Stop => STOP_FLAGS,
        OperationVerb::Restart => RESTART_FLAGS,
        OperationVerb::Pull => PULL_FLAGS,
        OperationVerb::CreateArchive | OperationVerb::ExtractArchive => ARCHIVE_FLAGS,
    }
}

fn screen_metacharacters(arg: &str) -> Result<(), ValidationError> {
    if arg.contains(FORBIDDEN_CHARS) {
        return Err(ValidationError::ForbiddenCharacters(arg.to_string()));
    }
    Ok(())
}

fn check_value(option: &str, value: &str, rule: &ValueRule) -> Result<(), ValidationError> {
    let ok = match rule {
        ValueRule::None => unreachable!("flags without values are not value-checked"),
        ValueRule::OneOf(allowed) => allowed.contains(&value),
        ValueRule::Digits => DIGITS.is_match(value),
        ValueRule::Scale => SCALE_VALUE.is_match(value),
        ValueRule::Free => !value.is_empty(),
    };
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidValue {
            option: option.to_string(),
            value: value.to_string(),
        })
    }
}

/// Validate a whole request and return its parsed verb.
///
/// Fails before any side effect: path resolution, vault construction, and
/// process spawning all happen after this returns `Ok`.
pub fn validate_request(request: &OperationRequest) -> Result<OperationVerb, ValidationError> {
    let verb = OperationVerb::parse(&request.command)?;
    let flags = flags_for(verb);

    let mut iter = request.options.iter().peekable();
    while let Some(token) = iter.next() {
        screen_metacharacters(token)?;

        let (name, inline_value) = match token.split_once('=') {
            Some((name, value)) if name.starts_with('-') => (name, Some(value.to_string())),
            _ => (token.as_str(), None),
        };

        let spec = flags
            .iter()
            .find(|spec| spec.names.contains(&name))
            .ok_or_else(|| ValidationError::UnknownOption {
                verb,
                option: name.to_string(),
            })?;

        match spec.value {
            ValueRule::None => {
                if inline_value.is_some() {
                    return Err(ValidationError::InvalidValue {
                        option: name.to_string(),
                        value: inline_value.unwrap_or_default(),
                    });
                }
            }
            ref rule => {
                let value = match inline_value {
                    Some(value) => value,
                    None => {
                        let next = iter
                            .next()
                            .ok_or_else(|| ValidationError::MissingValue(name.to_string()))?;
                        screen_metacharacters(next)?;
                        next.clone()
                    }
                };
                check_value(name, &value, rule)?;
            }
        }
    }

    for service in &request.services {
        screen_metacharacters(service)?;
        if service.len() > 64 || !SERVICE_NAME.is_match(service) {
            return Err(ValidationError::InvalidServiceName(service.clone()));
        }
    }

    for credential in &request.credentials {
        if credential.registry.is_empty() {
            return Err(ValidationError::IncompleteCredential("registry"));
        }
        if credential.username.is_empty() {
            return Err(ValidationError::IncompleteCredential("username"));
        }
        // Registry and username become argv elements of the engine login
        // command; the password travels over stdin and is not screened.
        screen_metacharacters(&credential.registry)?;
        screen_metacharacters(&credential.username)?;
    }

    Ok(verb)
}
