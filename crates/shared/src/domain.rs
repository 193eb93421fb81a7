use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ServerId);
id_newtype!(ChannelId);
id_newtype!(MessageId);

/// Per-channel ordering key. The first message of a channel has `seq == 1`
/// and every append takes the next integer, so a live event whose key is not
/// `watermark + 1` means the client missed something.
pub type ChannelSeq = i64;
