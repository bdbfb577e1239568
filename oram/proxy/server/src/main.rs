// Copyright (c) 2018-2021 The MobileCoin Foundation

//! ORAM proxy server entry point.

use oram_proxy_server::{
    create_root_logger,
    dispatcher::RequestDispatcher,
    listener::{ClientListener, TcpResponder},
    processor::Processor,
    sequencer::Sequencer,
    ProxyServerConfig,
};
use oram_storage_connection::TcpStorageConnection;
use slog::{info, o};
use std::sync::Arc;
use structopt::StructOpt;

fn main() {
    let logger = create_root_logger();

    let config = ProxyServerConfig::from_args();
    config.validate().expect("invalid configuration");

    let connections: Vec<TcpStorageConnection> = config
        .storage_servers
        .iter()
        .map(|addr| {
            TcpStorageConnection::new(*addr, logger.new(o!("storage" => addr.to_string())))
        })
        .collect();

    let sequencer = Arc::new(Sequencer::new(
        TcpResponder::new(logger.new(o!("component" => "responder"))),
        logger.new(o!("component" => "sequencer")),
    ));

    let processor = Arc::new(Processor::new(
        &config,
        connections,
        sequencer.clone(),
        logger.new(o!("component" => "processor")),
    ));

    let dispatcher = Arc::new(RequestDispatcher::new(
        processor,
        config.request_workers,
        logger.new(o!("component" => "dispatcher")),
    ));

    let listener = ClientListener::bind(
        config.client_listen_addr,
        sequencer,
        dispatcher,
        config.block_size,
        logger.new(o!("component" => "listener")),
    )
    .expect("could not bind client listener");

    info!(
        logger,
        "oram proxy serving {} storage servers on {}",
        config.storage_servers.len(),
        listener.local_addr()
    );

    listener.join();
}
