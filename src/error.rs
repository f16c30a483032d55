pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("the platform notification resource could not be created (os error {0})")]
	InitFailure(i32),
	#[error("unable to watch path (os error {errno})")]
	WatchFailed { errno: i32 },
	#[error("invalid watcher handle")]
	InvalidArgument,
	#[error("duplicate key in handle registry")]
	DuplicateKey,
	#[error("invalid key in handle registry")]
	InvalidKey,
}

impl Error {
	/// OS error number carried by this error, if any.
	pub fn errno(&self) -> Option<i32> {
		match self {
			Self::InitFailure(errno) | Self::WatchFailed { errno } => Some(*errno),
			_ => None,
		}
	}
}
