//! Encrypted signaling over one connected stream.
//!
//! Each frame carries one envelope whose plaintext is one JSON signaling
//! document. Reading checks, in order: framing, decryption, sender
//! identity, document shape.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};

use peercall_crypto::{envelope, CryptoError, IdentityKeyPair, PublicKey};
use peercall_protocol::codec::{decode_signal, encode_signal, write_message, FrameReader};
use peercall_protocol::{ProtocolError, SignalMessage};

use crate::network::BoxStream;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer closed the stream between messages.
    #[error("connection closed by peer")]
    Closed,

    #[error("timed out waiting for peer")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[from] ProtocolError),

    #[error("envelope rejected: {0}")]
    Crypto(#[from] CryptoError),

    /// Valid envelope, but sealed by someone other than the expected peer.
    #[error("message sealed by unexpected key {}", .0.short())]
    Impostor(PublicKey),

    #[error("malformed signaling document: {0}")]
    Malformed(String),
}

pub struct SignalReader {
    frames: FrameReader<ReadHalf<BoxStream>>,
    identity: Arc<IdentityKeyPair>,
}

pub struct SignalWriter {
    half: WriteHalf<BoxStream>,
    identity: Arc<IdentityKeyPair>,
}

pub fn split(stream: BoxStream, identity: Arc<IdentityKeyPair>) -> (SignalReader, SignalWriter) {
    let (read_half, write_half) = tokio::io::split(stream);
    (
        SignalReader {
            frames: FrameReader::new(read_half),
            identity: identity.clone(),
        },
        SignalWriter {
            half: write_half,
            identity,
        },
    )
}

impl SignalReader {
    /// Next message from whoever sealed it. Used when the sender is not
    /// known yet; the caller must authenticate the returned key.
    pub async fn recv_any(&mut self) -> Result<(SignalMessage, PublicKey), ChannelError> {
        let frame = self
            .frames
            .read_message()
            .await?
            .ok_or(ChannelError::Closed)?;
        let opened = envelope::decrypt(&frame, self.identity.public(), self.identity.secret())?;
        let msg = decode_signal(&opened.plaintext).map_err(|e| ChannelError::Malformed(e.to_string()))?;
        Ok((msg, opened.sender))
    }

    /// Next message, which must come from `expected`.
    pub async fn recv_from(&mut self, expected: &PublicKey) -> Result<SignalMessage, ChannelError> {
        let frame = self
            .frames
            .read_message()
            .await?
            .ok_or(ChannelError::Closed)?;
        let opened = envelope::decrypt(&frame, self.identity.public(), self.identity.secret())?;
        if !opened.is_from(expected) {
            return Err(ChannelError::Impostor(opened.sender));
        }
        decode_signal(&opened.plaintext).map_err(|e| ChannelError::Malformed(e.to_string()))
    }
}

impl SignalWriter {
    pub async fn send(&mut self, to: &PublicKey, msg: &SignalMessage) -> Result<(), ChannelError> {
        let doc = zeroize::Zeroizing::new(encode_signal(msg)?);
        let sealed = envelope::encrypt(
            &doc,
            to,
            self.identity.public(),
            self.identity.secret(),
        )?;
        write_message(&mut self.half, &sealed).await?;
        Ok(())
    }

    /// Shut down the write side; the peer's reader sees end-of-stream.
    pub async fn close(&mut self) {
        let _ = self.half.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (BoxStream, BoxStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    #[tokio::test]
    async fn messages_flow_between_peers() {
        let alice = Arc::new(IdentityKeyPair::generate());
        let bob = Arc::new(IdentityKeyPair::generate());
        let (a, b) = pair();
        let (_a_reader, mut a_writer) = split(a, alice.clone());
        let (mut b_reader, _b_writer) = split(b, bob.clone());

        a_writer
            .send(
                bob.public(),
                &SignalMessage::Call {
                    offer: "v=0".into(),
                },
            )
            .await
            .unwrap();
        let (msg, sender) = b_reader.recv_any().await.unwrap();
        assert_eq!(sender, *alice.public());
        assert_eq!(
            msg,
            SignalMessage::Call {
                offer: "v=0".into()
            }
        );

        a_writer.send(bob.public(), &SignalMessage::Ping).await.unwrap();
        assert_eq!(
            b_reader.recv_from(alice.public()).await.unwrap(),
            SignalMessage::Ping
        );

        a_writer.close().await;
        assert!(matches!(b_reader.recv_any().await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn unexpected_sender_is_impostor() {
        let alice = Arc::new(IdentityKeyPair::generate());
        let bob = Arc::new(IdentityKeyPair::generate());
        let mallory = Arc::new(IdentityKeyPair::generate());
        let (m, b) = pair();
        let (_m_reader, mut m_writer) = split(m, mallory.clone());
        let (mut b_reader, _b_writer) = split(b, bob.clone());

        m_writer.send(bob.public(), &SignalMessage::Ringing).await.unwrap();
        match b_reader.recv_from(alice.public()).await {
            Err(ChannelError::Impostor(key)) => assert_eq!(key, *mallory.public()),
            other => panic!("expected impostor, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_for_someone_else_fails_decryption() {
        let alice = Arc::new(IdentityKeyPair::generate());
        let bob = Arc::new(IdentityKeyPair::generate());
        let carol = IdentityKeyPair::generate();
        let (a, b) = pair();
        let (_a_reader, mut a_writer) = split(a, alice.clone());
        let (mut b_reader, _b_writer) = split(b, bob);

        a_writer.send(carol.public(), &SignalMessage::Ping).await.unwrap();
        assert!(matches!(
            b_reader.recv_any().await,
            Err(ChannelError::Crypto(CryptoError::Decrypt))
        ));
    }

    #[tokio::test]
    async fn non_signal_document_is_malformed() {
        let alice = IdentityKeyPair::generate();
        let bob = Arc::new(IdentityKeyPair::generate());
        let (mut a, b) = pair();
        let (mut b_reader, _b_writer) = split(b, bob.clone());

        let sealed = envelope::encrypt(
            br#"{"action":"teleport"}"#,
            bob.public(),
            alice.public(),
            alice.secret(),
        )
        .unwrap();
        write_message(&mut a, &sealed).await.unwrap();

        assert!(matches!(
            b_reader.recv_from(alice.public()).await,
            Err(ChannelError::Malformed(_))
        ));
    }
}
