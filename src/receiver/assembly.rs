use chrono::{DateTime, Utc};
use dicom_ul::pdu::{PDataValue, PDataValueType};
use std::collections::HashMap;
use tracing::debug;

use crate::common::dimse::CommandSet;
use crate::error::{NodeError, Result};

/// A complete DIMSE message: its command set and, when announced, its dataset
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: CommandSet,
    pub dataset: Option<Vec<u8>>,
}

#[derive(Debug)]
struct PartialMessage {
    command_bytes: Vec<u8>,
    command: Option<CommandSet>,
    dataset: Vec<u8>,
    chunks: usize,
    started_at: DateTime<Utc>,
}

impl PartialMessage {
    fn new() -> Self {
        Self {
            command_bytes: Vec::new(),
            command: None,
            dataset: Vec::new(),
            chunks: 0,
            started_at: Utc::now(),
        }
    }
}

/// Reassembles command and data fragments, one message in flight per presentation context.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    partial: HashMap<u8, PartialMessage>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one PDV. Returns the message it completes, if any.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<DimseMessage>> {
        let pc_id = pdv.presentation_context_id;
        let message = self.partial.entry(pc_id).or_insert_with(PartialMessage::new);
        message.chunks += 1;

        match pdv.value_type {
            PDataValueType::Command => {
                if message.command.is_some() {
                    self.partial.remove(&pc_id);
                    return Err(NodeError::protocol(format!(
                        "command fragment on context {} after a complete command",
                        pc_id
                    )));
                }
                message.command_bytes.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }

                let command = match CommandSet::parse(&message.command_bytes) {
                    Ok(command) => command,
                    Err(e) => {
                        self.partial.remove(&pc_id);
                        return Err(e);
                    }
                };
                if command.has_dataset {
                    message.command = Some(command);
                    return Ok(None);
                }
                self.partial.remove(&pc_id);
                Ok(Some(DimseMessage {
                    presentation_context_id: pc_id,
                    command,
                    dataset: None,
                }))
            }
            PDataValueType::Data => {
                if message.command.is_none() {
                    self.partial.remove(&pc_id);
                    return Err(NodeError::protocol(format!(
                        "data fragment on context {} before its command",
                        pc_id
                    )));
                }
                message.dataset.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }

                let Some(message) = self.partial.remove(&pc_id) else {
                    return Ok(None);
                };
                debug!(
                    "Reassembled dataset: {} bytes from {} fragments in {} ms",
                    message.dataset.len(),
                    message.chunks,
                    (Utc::now() - message.started_at).num_milliseconds()
                );
                match message.command {
                    Some(command) => Ok(Some(DimseMessage {
                        presentation_context_id: pc_id,
                        command,
                        dataset: Some(message.dataset),
                    })),
                    None => Ok(None),
                }
            }
        }
    }

    /// Whether any message is partially received
    pub fn is_idle(&self) -> bool {
        self.partial.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.partial
            .values()
            .map(|m| m.command_bytes.len() + m.dataset.len())
            .sum()
    }
}
