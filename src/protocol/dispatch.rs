//! Per-request dispatch flags

use bitflags::bitflags;

bitflags! {
    /// Options controlling how a single request is dispatched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequestFlags: u8 {
        /// Wait for the response without a deadline.
        const NO_TIMEOUT = 0x01;
        /// Surface the first send failure instead of retrying once.
        const NO_RETRY = 0x02;
        /// Keep the raw response frame on the returned response.
        const RETAIN_PAYLOAD = 0x04;
    }
}

impl RequestFlags {
    pub const NONE: Self = Self::empty();

    pub fn no_timeout(self) -> bool {
        self.contains(Self::NO_TIMEOUT)
    }

    pub fn no_retry(self) -> bool {
        self.contains(Self::NO_RETRY)
    }

    pub fn retain_payload(self) -> bool {
        self.contains(Self::RETAIN_PAYLOAD)
    }
}
