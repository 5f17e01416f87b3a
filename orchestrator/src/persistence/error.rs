/// Errors possible when interacting with the state store.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("database interaction failed: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("record not found")]
    NotFound,
    #[error("deployment still has live infrastructure")]
    LiveInfrastructure,
}

pub type Result<T> = std::result::Result<T, Error>;
