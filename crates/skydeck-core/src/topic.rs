// Topic identity and flat-key serialization.
//
// A topic names one logical stream of snapshots. On the wire it travels
// as a flat key: `kind:stream:instance`, with the stream segment elided
// when it is the kind's default (`kind:instance`). Instance ids must not
// contain `:`.

use std::fmt;

use skydeck_api::{InstanceId, ServiceKind, StreamKind};

use crate::error::CoreError;

/// Identifier for one logical stream of snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub kind: ServiceKind,
    pub stream: StreamKind,
    pub instance_id: InstanceId,
}

impl Topic {
    pub fn new(kind: ServiceKind, stream: StreamKind, instance_id: InstanceId) -> Self {
        Self {
            kind,
            stream,
            instance_id,
        }
    }

    /// Topic for an instance's default stream.
    pub fn for_instance(kind: ServiceKind, instance_id: InstanceId) -> Self {
        Self::new(kind, kind.default_stream(), instance_id)
    }

    /// Canonical flat key. Everything that stores or routes topics keys
    /// off this string, so the default-stream elision is applied in
    /// exactly one place.
    pub fn key(&self) -> String {
        if self.stream == self.kind.default_stream() {
            format!("{}:{}", self.kind, self.instance_id)
        } else {
            format!("{}:{}:{}", self.kind, self.stream, self.instance_id)
        }
    }

    /// Parse a flat key back into a topic.
    pub fn parse(key: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidTopic {
            key: key.to_owned(),
            reason: reason.to_owned(),
        };

        let mut parts = key.splitn(3, ':');
        let kind: ServiceKind = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("missing service kind"))?
            .parse()
            .map_err(|_| invalid("unknown service kind"))?;

        let (stream, instance) = match (parts.next(), parts.next()) {
            (Some(instance), None) => (kind.default_stream(), instance),
            (Some(stream), Some(instance)) => (
                stream
                    .parse::<StreamKind>()
                    .map_err(|_| invalid("unknown stream"))?,
                instance,
            ),
            _ => return Err(invalid("missing instance id")),
        };

        if instance.is_empty() {
            return Err(invalid("missing instance id"));
        }
        if !kind.supported_streams().contains(&stream) {
            return Err(invalid("stream not supported by this service"));
        }

        Ok(Self::new(kind, stream, instance.into()))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_stream_is_elided_from_the_key() {
        let topic = Topic::for_instance(ServiceKind::Jellyfin, "jf-1".into());
        assert_eq!(topic.key(), "jellyfin:jf-1");

        let explicit = Topic::new(ServiceKind::Jellyfin, StreamKind::Library, "jf-1".into());
        assert_eq!(explicit.key(), "jellyfin:library:jf-1");
    }

    #[test]
    fn parse_round_trips_both_forms() {
        for key in ["jellyfin:jf-1", "jellyfin:library:jf-1", "qbittorrent:qb"] {
            let topic = Topic::parse(key).expect(key);
            assert_eq!(topic.key(), key);
        }
    }

    #[test]
    fn short_form_resolves_to_the_default_stream() {
        let topic = Topic::parse("sonarr:tv").expect("parse");
        assert_eq!(topic.stream, StreamKind::Queue);
        // Explicit default normalizes to the short key.
        let explicit = Topic::parse("sonarr:queue:tv").expect("parse");
        assert_eq!(explicit, topic);
        assert_eq!(explicit.key(), "sonarr:tv");
    }

    #[test]
    fn rejects_malformed_keys() {
        for key in ["", "jellyfin", "nope:x", "jellyfin:torrents:jf-1", "sonarr::"] {
            assert!(Topic::parse(key).is_err(), "{key} should not parse");
        }
    }
}
