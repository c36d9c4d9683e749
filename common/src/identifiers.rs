// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{fmt, net::Ipv4Addr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("name must not be empty")]
    Empty,
}

macro_rules! name_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
                let name = name.into();
                if name.is_empty() {
                    return Err(NameError::Empty);
                }
                Ok(Self(name))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = NameError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

name_newtype!(
    /// Name of a configured service, unique per configuration.
    ServiceName
);

name_newtype!(
    /// Name of a dispatch endpoint within a service, unique per service.
    HandleName
);

/// Globally unique message correlation id. Rendered as the 36-character
/// textual form of a v4 UUID on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// Size of the textual form, accounted against cache capacity.
    pub const WIRE_LEN: usize = 36;
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Two-level logical address of a message. Equality is componentwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessagePath {
    pub service_name: ServiceName,
    pub handle_name: HandleName,
}

impl MessagePath {
    pub fn new(service_name: ServiceName, handle_name: HandleName) -> Self {
        Self {
            service_name,
            handle_name,
        }
    }

    /// Bytes this path contributes to a message's accounted size.
    pub fn wire_size(&self) -> usize {
        self.service_name.as_str().len() + self.handle_name.as_str().len()
    }
}

impl fmt::Display for MessagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_name, self.handle_name)
    }
}

/// A worker process endpoint. The port is the handle's advertised port, not
/// the service's control port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A dispatch endpoint advertised by a peer during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleInfo {
    pub name: HandleName,
    pub service_name: ServiceName,
    pub port: u16,
}

impl fmt::Display for HandleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.service_name, self.name, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_names_are_rejected() {
        assert_eq!(ServiceName::new("").unwrap_err(), NameError::Empty);
        assert_eq!(HandleName::new("").unwrap_err(), NameError::Empty);
        assert!(ServiceName::new("billing").is_ok());
    }

    #[test]
    fn message_id_has_wire_len() {
        let id = MessageId::random();
        assert_eq!(id.to_string().len(), MessageId::WIRE_LEN);
    }

    #[test]
    fn path_equality_is_componentwise() {
        let a = MessagePath::new(
            ServiceName::new("svc").unwrap(),
            HandleName::new("h").unwrap(),
        );
        let b = MessagePath::new(
            ServiceName::new("svc").unwrap(),
            HandleName::new("h").unwrap(),
        );
        let c = MessagePath::new(
            ServiceName::new("svc").unwrap(),
            HandleName::new("other").unwrap(),
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.wire_size(), 4);
    }
}
