use crate::config::{MAX_CHANNELS, MAX_PHYS_CHANNELS};

#[derive(Debug, derive_more::Display, derive_more::IsVariant)]
enum ErrorPayload {
    #[display(
        fmt = "unsupported physical channel count {} (this device drives 1..={})",
        _0,
        "MAX_PHYS_CHANNELS"
    )]
    PhysChannelCount(usize),

    #[display(fmt = "physical channel index {} out of range for {} channels", _0, _1)]
    PhysChannelIndex(usize, usize),

    #[display(fmt = "logical channel capacity exhausted ({} active)", "MAX_CHANNELS")]
    ChannelCapacity,

    #[display(fmt = "logical channel {} is not mapped", _0)]
    NoSuchChannel(u32),
}

/// An error from a configuration-time operation.
///
/// Synthesis-path failures are never reported this way; they are recorded in counters and flags polled by the owning
/// components (see the underflow and restart accessors).  Errors of this type are returned synchronously by the call
/// that introduces the invalid configuration.
#[derive(Debug, thiserror::Error)]
#[error("{payload}")]
pub struct Error {
    payload: ErrorPayload,
}

macro_rules! ctor {
    ($name: ident, $variant: expr $(, $arg:ident : $ty:ty)*) => {
        pub(crate) fn $name($($arg: $ty),*) -> Error {
            Error { payload: $variant }
        }
    };
}

impl Error {
    ctor!(phys_channel_count, ErrorPayload::PhysChannelCount(n), n: usize);
    ctor!(phys_channel_index, ErrorPayload::PhysChannelIndex(index, of), index: usize, of: usize);
    ctor!(channel_capacity, ErrorPayload::ChannelCapacity);
    ctor!(no_such_channel, ErrorPayload::NoSuchChannel(chn), chn: u32);

    /// Does this error mean the fixed logical channel capacity was exceeded?
    pub fn is_channel_capacity(&self) -> bool {
        self.payload.is_channel_capacity()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
