//! Event signing capability.
//!
//! Key handling stays outside this crate. The pool only needs something that
//! turns an [`EventTemplate`] into a signed, content-addressed [`Event`].

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use nostr::{Event, EventTemplate, verify_event_id};

#[async_trait]
pub trait EventSigner: Send + Sync {
    /// Hex public key events are signed with.
    fn pubkey(&self) -> String;

    /// Sign `template` as `pubkey()`.
    async fn sign(&self, template: EventTemplate) -> Result<Event>;
}

/// Sign `template` and check the result is what was asked for.
pub async fn sign_checked(signer: &dyn EventSigner, template: EventTemplate) -> Result<Event> {
    let kind = template.kind;
    let event = signer.sign(template).await?;

    if event.pubkey != signer.pubkey() {
        return Err(ClientError::Signing(format!(
            "signer returned event for {}, expected {}",
            event.pubkey,
            signer.pubkey()
        )));
    }
    if event.kind != kind || !verify_event_id(&event) {
        return Err(ClientError::InvalidEvent(format!(
            "signed event {} does not match its template",
            event.id
        )));
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSigner {
        pubkey: String,
        tamper: bool,
    }

    #[async_trait]
    impl EventSigner for FakeSigner {
        fn pubkey(&self) -> String {
            self.pubkey.clone()
        }

        async fn sign(&self, template: EventTemplate) -> Result<Event> {
            let mut event = template
                .into_unsigned(self.pubkey.clone())
                .into_event("00".repeat(64))
                .map_err(|e| ClientError::Signing(e.to_string()))?;
            if self.tamper {
                event.content.push('!');
            }
            Ok(event)
        }
    }

    fn template() -> EventTemplate {
        EventTemplate {
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn test_sign_checked() {
        let signer = FakeSigner {
            pubkey: "ab".repeat(32),
            tamper: false,
        };
        let event = sign_checked(&signer, template()).await.unwrap();
        assert_eq!(event.pubkey, "ab".repeat(32));
        assert!(verify_event_id(&event));
    }

    #[tokio::test]
    async fn test_tampered_event_is_rejected() {
        let signer = FakeSigner {
            pubkey: "ab".repeat(32),
            tamper: true,
        };
        assert!(matches!(
            sign_checked(&signer, template()).await,
            Err(ClientError::InvalidEvent(_))
        ));
    }
}
