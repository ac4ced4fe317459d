use tokio::sync::broadcast;

use crate::models::{
    ContractCreatedNotification, ContractDeletedNotification, ContractEventData,
    StreamStopEventData, StreamStoppedNotification,
};

#[derive(Clone)]
pub enum Event {
    ContractCreated(ContractCreatedNotification),
    ContractDeleted(ContractDeletedNotification),
    StreamStopped(StreamStoppedNotification),
}

/// In-process bus between the host CRUD layer and the stream supervisor.
pub struct EventSystem {
    sender: broadcast::Sender<Event>,
}

impl EventSystem {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn handle_contract_created(&self, contract_id: i64, mint: impl Into<String>) {
        self.emit(Event::ContractCreated(ContractCreatedNotification {
            data: ContractEventData {
                contract_id,
                mint: mint.into(),
            },
            type_: "contract_created".to_string(),
        }));
    }

    pub fn handle_contract_deleted(&self, contract_id: i64, mint: impl Into<String>) {
        self.emit(Event::ContractDeleted(ContractDeletedNotification {
            data: ContractEventData {
                contract_id,
                mint: mint.into(),
            },
            type_: "contract_deleted".to_string(),
        }));
    }

    pub fn handle_stream_stopped(&self, contract_id: i64, reason: impl Into<String>) {
        self.emit(Event::StreamStopped(StreamStoppedNotification {
            data: StreamStopEventData {
                contract_id,
                reason: reason.into(),
            },
            type_: "stream_stopped".to_string(),
        }));
    }
}

impl Default for EventSystem {
    fn default() -> Self {
        Self::new()
    }
}
