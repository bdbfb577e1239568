// Copyright (c) 2018-2021 The MobileCoin Foundation

//! The client-facing boundary: a TCP accept loop, one reader thread per
//! session, and the responder that connects back to a client's stated
//! address with each framed answer.
//!
//! Framing or codec errors drop the offending connection and nothing else.
//! A client that disappears mid-request costs nothing: its request still
//! runs to completion (cancelling a fetch would leak the cancellation) and
//! the undeliverable response is dropped silently.

use crate::{
    dispatcher::RequestDispatcher,
    error::Result,
    sequencer::{ClientResponder, Sequencer},
};
use oram_types::{
    framed::{read_frame, write_frame},
    messages::{ClientOp, ClientRequest, ProxyResponse, PROXY_RESPONSE},
};
use slog::{info, warn, Logger};
use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread::{Builder as ThreadBuilder, JoinHandle},
};

/// Delivers responses by connecting to the client's stated `host:port` and
/// writing one framed `PROXY_RESPONSE`.
pub struct TcpResponder {
    logger: Logger,
}

impl TcpResponder {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

impl ClientResponder for TcpResponder {
    fn respond(&self, req: &ClientRequest, data: &[u8]) {
        let response = match req.op {
            ClientOp::Read => ProxyResponse::Read {
                request_id: req.request_id,
                data: data.to_vec(),
            },
            ClientOp::Write => ProxyResponse::Write {
                request_id: req.request_id,
                success: true,
            },
        };

        let addr = format!("{}:{}", req.client.host, req.client.port);
        match TcpStream::connect(&addr) {
            Ok(mut stream) => {
                if let Err(err) = write_frame(&mut stream, PROXY_RESPONSE, &response.encode()) {
                    warn!(
                        self.logger,
                        "dropping response for request {}: {}", req.request_id, err
                    );
                }
            }
            Err(err) => {
                // The client went away; the access already happened and the
                // pattern is preserved, so this is not an error path.
                warn!(
                    self.logger,
                    "client {} unreachable, dropping response: {}", addr, err
                );
            }
        }
    }
}

/// Accepts client connections and feeds their requests to the dispatcher.
pub struct ClientListener {
    local_addr: SocketAddr,
    join_handle: JoinHandle<()>,
}

impl ClientListener {
    /// Bind and start accepting. Sessions enqueue with the sequencer first,
    /// then dispatch, so response ordering matches arrival ordering.
    pub fn bind(
        addr: SocketAddr,
        sequencer: Arc<Sequencer>,
        dispatcher: Arc<RequestDispatcher>,
        block_size: usize,
        logger: Logger,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let join_handle = ThreadBuilder::new()
            .name("ClientListener".to_owned())
            .spawn(move || {
                info!(logger, "listening for clients on {}", local_addr);
                for stream in listener.incoming() {
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(err) => {
                            warn!(logger, "accept failed: {}", err);
                            continue;
                        }
                    };
                    let session_sequencer = sequencer.clone();
                    let session_dispatcher = dispatcher.clone();
                    let session_logger = logger.clone();
                    if let Err(err) = ThreadBuilder::new()
                        .name("ClientSession".to_owned())
                        .spawn(move || {
                            Self::run_session(
                                stream,
                                session_sequencer,
                                session_dispatcher,
                                block_size,
                                session_logger,
                            )
                        })
                    {
                        warn!(logger, "could not spawn session: {}", err);
                    }
                }
            })
            .expect("Could not spawn thread");

        Ok(Self {
            local_addr,
            join_handle,
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until the accept loop exits.
    pub fn join(self) {
        let _ = self.join_handle.join();
    }

    fn run_session(
        mut stream: TcpStream,
        sequencer: Arc<Sequencer>,
        dispatcher: Arc<RequestDispatcher>,
        block_size: usize,
        logger: Logger,
    ) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_owned());
        loop {
            let (message_type, payload) = match read_frame(&mut stream) {
                Ok(frame) => frame,
                Err(err) => {
                    // EOF on a clean close lands here too; either way the
                    // session is over and only this session.
                    if err.kind() != io::ErrorKind::UnexpectedEof {
                        warn!(logger, "dropping session {}: {}", peer, err);
                    }
                    return;
                }
            };

            let req = match ClientRequest::decode(message_type, &payload, block_size) {
                Ok(req) => req,
                Err(err) => {
                    warn!(logger, "protocol error from {}: {}, dropping", peer, err);
                    return;
                }
            };

            sequencer.enqueue(req.clone());
            if dispatcher.dispatch(req).is_err() {
                return;
            }
        }
    }
}
