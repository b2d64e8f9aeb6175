//! Crate-level error.

use thiserror::Error;

use crate::codec::CodecError;
use crate::container::ContainerError;
use crate::convert::ConversionError;
use crate::schema::SchemaError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
