//! Command handlers for dongle operations.
//!
//! This module wraps [`Link::exchange`] with one typed call per command,
//! checking that the dongle answered with the matching response and a zero
//! return code.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::link::Link;
use crate::protocol::{Command, CommandOpcode, Response, WriteOperation};
use crate::types::{AddressType, BluetoothAddress};

/// Command handler for dongle operations.
#[derive(Clone)]
pub struct CommandHandler {
    link: Arc<Link>,
}

impl CommandHandler {
    /// Creates a new command handler.
    #[must_use]
    pub const fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    /// Returns the underlying link.
    #[must_use]
    pub const fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// Sends a command and checks the response kind and return code.
    async fn send_expect_ok(&self, command: Command) -> Result<Response> {
        let opcode = command.opcode();
        let response = self.link.exchange(command).await?;
        check(opcode, response)
    }

    /// Queries the firmware identification string.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the dongle rejects it.
    pub async fn whoami(&self) -> Result<String> {
        match self.send_expect_ok(Command::Whoami).await? {
            Response::Whoami { firmware, .. } => Ok(firmware),
            other => Err(unexpected(CommandOpcode::Whoami, &other)),
        }
    }

    /// Resets the dongle.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the dongle rejects it.
    pub async fn reset(&self) -> Result<()> {
        self.send_expect_ok(Command::Reset).await.map(drop)
    }

    /// Initializes the BLE stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the dongle rejects it.
    pub async fn init(&self) -> Result<()> {
        self.send_expect_ok(Command::Init).await.map(drop)
    }

    /// Starts scanning.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the dongle rejects it.
    pub async fn scan_start(&self) -> Result<()> {
        self.send_expect_ok(Command::ScanStart).await.map(drop)
    }

    /// Stops scanning.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the dongle rejects it.
    pub async fn scan_stop(&self) -> Result<()> {
        self.send_expect_ok(Command::ScanStop).await.map(drop)
    }

    /// Starts a connection attempt. Completion is reported by an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the dongle rejects it.
    pub async fn connect(&self, address_type: AddressType, address: BluetoothAddress) -> Result<()> {
        self.send_expect_ok(Command::Connect {
            address_type,
            address,
        })
        .await
        .map(drop)
    }

    /// Starts a disconnection. Completion is reported by an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the dongle rejects it.
    pub async fn disconnect(&self, conn_handle: u16) -> Result<()> {
        self.send_expect_ok(Command::Disconnect { conn_handle })
            .await
            .map(drop)
    }

    /// Reads an attribute value.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the dongle rejects it.
    pub async fn read(&self, conn_handle: u16, handle: u16) -> Result<Bytes> {
        match self
            .send_expect_ok(Command::Read {
                conn_handle,
                handle,
            })
            .await?
        {
            Response::Read { data, .. } => Ok(data),
            other => Err(unexpected(CommandOpcode::Read, &other)),
        }
    }

    /// Writes an attribute value.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the dongle rejects it.
    pub async fn write(
        &self,
        conn_handle: u16,
        handle: u16,
        op: WriteOperation,
        data: Bytes,
    ) -> Result<()> {
        self.send_expect_ok(Command::Write {
            conn_handle,
            handle,
            op,
            data,
        })
        .await
        .map(drop)
    }
}

fn unexpected(opcode: CommandOpcode, got: &Response) -> Error {
    Error::UnexpectedResponse {
        command: opcode.name(),
        got: format!("{got:?}"),
    }
}

fn check(opcode: CommandOpcode, response: Response) -> Result<Response> {
    if response.opcode() != opcode {
        return Err(unexpected(opcode, &response));
    }
    match response.ret_code() {
        0 => Ok(response),
        ret_code => Err(Error::CommandFailed {
            command: opcode.name(),
            ret_code,
        }),
    }
}
