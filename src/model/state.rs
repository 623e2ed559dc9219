//! Entity States

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// State enum of one entity kind
pub trait EntityState: Copy + Eq + FromStr<Err = Error> + Send + Sync + 'static {
    /// Wire name of the state
    fn as_str(&self) -> &'static str;
}

macro_rules! entity_state {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl EntityState for $name {
            fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    _ => Err(Error::InvalidState {
                        kind: $kind,
                        value: value.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

entity_state! {
    /// Image build states
    BuildState, "image build" {
        Building => "building",
        Ready => "ready",
        Deleting => "deleting",
        Failed => "failed",
    }
}

entity_state! {
    /// Image upload states
    UploadState, "image upload" {
        Uploading => "uploading",
        Ready => "ready",
        Deleting => "deleting",
        Failed => "failed",
    }
}

entity_state! {
    /// Node request states
    RequestState, "node request" {
        Requested => "requested",
        Pending => "pending",
        Fulfilled => "fulfilled",
        Failed => "failed",
    }
}

entity_state! {
    /// Node states. Transitions are up to the caller; typically
    /// init, building, ready, in-use, used, deleting, deleted.
    NodeState, "node" {
        Building => "building",
        Testing => "testing",
        Ready => "ready",
        InUse => "in-use",
        Used => "used",
        Hold => "hold",
        Deleting => "deleting",
        Failed => "failed",
        Init => "init",
        Aborted => "aborted",
        Deleted => "deleted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        assert_eq!("in-use".parse::<NodeState>().unwrap(), NodeState::InUse);
        assert_eq!(NodeState::InUse.to_string(), "in-use");
        assert_eq!(
            serde_json::to_string(&RequestState::Fulfilled).unwrap(),
            "\"fulfilled\""
        );
    }

    #[test]
    fn test_states_are_per_kind() {
        // "uploading" only exists for uploads
        assert!("uploading".parse::<UploadState>().is_ok());
        let err = "uploading".parse::<BuildState>().unwrap_err();
        assert!(matches!(err, Error::InvalidState { kind: "image build", .. }));
        assert!(serde_json::from_str::<NodeState>("\"requested\"").is_err());
    }
}
