use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration error")]
    Config,
    #[display("could not open the cache database")]
    Cache,
    #[display("could not set up backend for workspace {_0}")]
    Backend(#[error(not(source))] String),
    #[display("{_0} support was not compiled in")]
    Disabled(#[error(not(source))] &'static str),
    #[display("sync failed")]
    Sync,
}
