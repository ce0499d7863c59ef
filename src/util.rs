use std::io;
use std::io::ErrorKind::WouldBlock;

pub trait NoBlock {
    type Value;

    fn no_block(self) -> io::Result<Self::Value>;
}

impl<T> NoBlock for io::Result<T> {
    type Value = Option<T>;

    fn no_block(self) -> io::Result<Self::Value> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}
