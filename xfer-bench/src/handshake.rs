//! Control-channel handshake between the two endpoints of a pair.
//!
//! Both roles walk the same states, `Init -> IdentityExchanged ->
//! DescriptorsExchanged -> Ready`. What a role does to leave a state is
//! looked up in [`script`], so the send/receive ordering of the two sides
//! can be read off one table:
//!
//! | state              | creator                         | peer                          |
//! |--------------------|---------------------------------|-------------------------------|
//! | Init               | send metadata, recv metadata    | recv metadata, send metadata  |
//! | IdentityExchanged  | send START, recv descs, prepare | expect START, send descs      |
//!
//! Any blocking receive stays blocked until the remote sends or hangs up.

use log::{debug, info};
use xfer_channel::ControlChannel;
use xfer_engine::{
    SessionId, TransferEngine, TransferHandle, XferDescList, XferOp,
};
use xfer_error::{BenchError, Result};

use crate::endpoint::{RemoteEndpointRef, Role, UnitContext};

/// Token the creator sends to announce that descriptors may follow.
pub const START_TOKEN: &[u8] = b"START";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    IdentityExchanged,
    DescriptorsExchanged,
    Ready,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    SendMetadata,
    RecvMetadata,
    SendStart,
    ExpectStart,
    SendDescriptors,
    RecvDescriptors,
    /// Build the transfer handle from local and remote descriptors.
    PrepareTransfer,
}

/// Steps `role` performs to leave `state`.
pub fn script(role: Role, state: HandshakeState) -> &'static [Step] {
    use HandshakeState::*;
    use Step::*;

    match (role, state) {
        (Role::Creator, Init) => &[SendMetadata, RecvMetadata],
        (Role::Peer, Init) => &[RecvMetadata, SendMetadata],
        (Role::Creator, IdentityExchanged) => {
            &[SendStart, RecvDescriptors, PrepareTransfer]
        }
        (Role::Peer, IdentityExchanged) => &[ExpectStart, SendDescriptors],
        (_, DescriptorsExchanged) | (_, Ready) => &[],
    }
}

fn next_state(state: HandshakeState) -> HandshakeState {
    match state {
        HandshakeState::Init => HandshakeState::IdentityExchanged,
        HandshakeState::IdentityExchanged => {
            HandshakeState::DescriptorsExchanged
        }
        HandshakeState::DescriptorsExchanged | HandshakeState::Ready => {
            HandshakeState::Ready
        }
    }
}

/// What one side knows once the handshake is complete.
///
/// Only the creator holds remote descriptors and a transfer handle. The
/// peer keeps the session id and the creator's identity, which is all it
/// needs to observe completion.
#[derive(Clone, Debug)]
pub struct TransferSession {
    pub op: XferOp,
    pub local: XferDescList,
    pub remote: Option<XferDescList>,
    pub session_id: SessionId,
    pub remote_agent: String,
    pub handle: Option<TransferHandle>,
}

pub struct Handshake<'a> {
    ctx: &'a UnitContext,
    engine: &'a dyn TransferEngine,
    channel: &'a mut ControlChannel,
    op: XferOp,
    session_id: SessionId,
    local: XferDescList,
    state: HandshakeState,
    /// Identity loaded into the engine, owned by the caller so it can be
    /// removed on teardown even if the handshake does not finish.
    loaded_remote: &'a mut Option<String>,
    remote: Option<RemoteEndpointRef>,
    remote_descs: Option<XferDescList>,
    handle: Option<TransferHandle>,
}

impl<'a> Handshake<'a> {
    pub fn new(
        ctx: &'a UnitContext,
        engine: &'a dyn TransferEngine,
        channel: &'a mut ControlChannel,
        op: XferOp,
        local: XferDescList,
        loaded_remote: &'a mut Option<String>,
    ) -> Self {
        Self {
            ctx,
            engine,
            channel,
            op,
            session_id: SessionId::for_pair(ctx.index),
            local,
            state: HandshakeState::Init,
            loaded_remote,
            remote: None,
            remote_descs: None,
            handle: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub async fn run(mut self) -> Result<(RemoteEndpointRef, TransferSession)> {
        while self.state != HandshakeState::Ready {
            self.advance().await?;
        }
        self.finish()
    }

    async fn advance(&mut self) -> Result<()> {
        for step in script(self.ctx.role, self.state) {
            debug!("{} {:?}: {:?}", self.ctx, self.state, step);
            self.perform(*step).await?;
        }

        if self.state == HandshakeState::Init {
            let identity = self.loaded_remote.as_deref().ok_or_else(|| {
                BenchError::ProtocolDesync(
                    "Identity phase ended without remote metadata".to_string(),
                )
            })?;
            let remote = RemoteEndpointRef::resolve(self.ctx.role, identity)?;
            info!("{} Paired with {}", self.ctx, remote.identity());
            self.remote = Some(remote);
        }

        self.state = next_state(self.state);
        Ok(())
    }

    async fn perform(&mut self, step: Step) -> Result<()> {
        match step {
            Step::SendMetadata => {
                let metadata =
                    self.engine.metadata().map_err(BenchError::into_setup)?;
                self.channel.send(metadata)?;
            }
            Step::RecvMetadata => {
                let metadata = self.channel.recv().await?;
                let identity = self
                    .engine
                    .add_remote_agent(&metadata)
                    .map_err(BenchError::into_setup)?;
                info!("{} Loaded remote agent {}", self.ctx, identity);
                *self.loaded_remote = Some(identity);
            }
            Step::SendStart => {
                self.channel.send(START_TOKEN)?;
            }
            Step::ExpectStart => {
                let message = self.channel.recv().await?;
                if message != START_TOKEN {
                    return Err(BenchError::ProtocolDesync(format!(
                        "Expected START, received {:?}",
                        String::from_utf8_lossy(&message)
                    )));
                }
            }
            Step::SendDescriptors => {
                let descs = self
                    .engine
                    .serialize_descs(&self.local)
                    .map_err(BenchError::into_setup)?;
                self.channel.send(descs)?;
                debug!("{} Sent {} descriptors", self.ctx, self.local.len());
            }
            Step::RecvDescriptors => {
                let bytes = self.channel.recv().await?;
                let descs =
                    self.engine.deserialize_descs(&bytes).map_err(|e| {
                        BenchError::ProtocolDesync(format!(
                            "Unreadable descriptor list: {}",
                            e
                        ))
                    })?;
                debug!("{} Received {} descriptors", self.ctx, descs.len());
                self.remote_descs = Some(descs);
            }
            Step::PrepareTransfer => {
                let (Some(remote), Some(remote_descs)) =
                    (self.remote.as_ref(), self.remote_descs.as_ref())
                else {
                    return Err(BenchError::ProtocolDesync(
                        "Cannot prepare a transfer before the remote side is \
                         known"
                            .to_string(),
                    ));
                };
                let handle = self
                    .engine
                    .initialize_transfer(
                        self.op,
                        &self.local,
                        remote_descs,
                        remote.identity(),
                        &self.session_id,
                    )
                    .map_err(BenchError::into_setup)?;
                self.handle = Some(handle);
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<(RemoteEndpointRef, TransferSession)> {
        let remote = self.remote.ok_or_else(|| {
            BenchError::ProtocolDesync(
                "Handshake finished without a remote endpoint".to_string(),
            )
        })?;
        let session = TransferSession {
            op: self.op,
            local: self.local,
            remote: self.remote_descs,
            session_id: self.session_id,
            remote_agent: remote.identity().to_string(),
            handle: self.handle,
        };
        Ok((remote, session))
    }
}
