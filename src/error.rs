use snafu::Snafu;

use crate::message::MessageStatus;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Message {message_id} is already queued"))]
    DuplicateMessage { message_id: String },

    #[snafu(display("Message {message_id} cannot move from {status} to {target}"))]
    InvalidTransition {
        message_id: String,
        status: MessageStatus,
        target: MessageStatus,
    },

    #[snafu(display("Lease on message {message_id} is no longer held by {owner}"))]
    LeaseLost { message_id: String, owner: String },

    #[snafu(display("Configuration error: {message}"))]
    Configuration { message: String },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Internal server error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }
}

impl Error {
    pub fn message_not_found(message_id: impl AsRef<str>) -> Self {
        Self::NotFound {
            resource: format!("message {}", message_id.as_ref()),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Whether this is a unique-key rejection from the database.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Sqlx {
                source: sqlx::Error::Database(e),
            } => e.is_unique_violation(),
            _ => false,
        }
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            Self::NotFound { .. } => actix_web::http::StatusCode::NOT_FOUND,

            Self::DuplicateMessage { .. }
            | Self::InvalidTransition { .. }
            | Self::LeaseLost { .. } => actix_web::http::StatusCode::CONFLICT,

            Self::InvalidParameter { .. } => actix_web::http::StatusCode::BAD_REQUEST,

            Self::Configuration { .. }
            | Self::MigrationError { .. }
            | Self::InternalServerError { .. }
            | Self::Sqlx { .. } => actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
