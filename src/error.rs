use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid parameter {name}: {message}")]
    Config { name: String, message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed input in {context}: {message}")]
    Format { context: String, message: String },

    #[error("record encoding failed: {0}")]
    Codec(#[from] bincode::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("task {task} failed: {source}")]
    Task {
        task: String,
        #[source]
        source: Box<Error>,
    },

    #[error("task {task} panicked: {message}")]
    TaskPanicked { task: String, message: String },

    #[error("hand-off channel closed early: {context}")]
    Disconnected { context: String },

    #[error("unknown similarity measure \"{0}\"")]
    UnknownMeasure(String),
}

impl Error {
    pub fn config(name: impl Into<String>, message: impl Into<String>) -> Error {
        Error::Config {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Error {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn format(context: impl Into<String>, message: impl Into<String>) -> Error {
        Error::Format {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn task(task: impl Into<String>, source: Error) -> Error {
        Error::Task {
            task: task.into(),
            source: Box::new(source),
        }
    }

    pub fn disconnected(context: impl Into<String>) -> Error {
        Error::Disconnected {
            context: context.into(),
        }
    }

    /// True for errors raised by eager validation, before any work started.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config { .. } | Error::UnknownMeasure(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::io("i/o", source)
    }
}
