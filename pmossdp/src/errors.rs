//! Erreurs de la pile SSDP / GENA

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SsdpError {
    #[error("Empty HTTP message")]
    EmptyMessage,
    #[error("Invalid HTTP message line: {0}")]
    MalformedHeader(String),
    #[error("HTTP field {0} is not present")]
    MissingField(String),
    #[error("HTTP element {element} is not present in field {field}")]
    MissingFieldElement { field: String, element: String },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid URL {0}: {1}")]
    InvalidUrl(String, String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} daemon has crashed, reset() it before registering again")]
    DaemonCrashed(&'static str),
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),
    #[error("Device returned UPnP error {code}: {description}")]
    Device { code: u32, description: String },
    #[error("Description error: {0}")]
    Description(String),
    #[error("XML error: {0}")]
    Xml(String),
}

impl SsdpError {
    pub fn missing_field(name: &str) -> Self {
        SsdpError::MissingField(name.to_string())
    }

    pub fn missing_field_element(field: &str, element: &str) -> Self {
        SsdpError::MissingFieldElement {
            field: field.to_string(),
            element: element.to_string(),
        }
    }

    pub fn invalid_url(url: &str, reason: impl ToString) -> Self {
        SsdpError::InvalidUrl(url.to_string(), reason.to_string())
    }
}

impl From<xmltree::ParseError> for SsdpError {
    fn from(err: xmltree::ParseError) -> Self {
        SsdpError::Xml(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SsdpError>;
