use super::header::{MessageClass, MessageType, ResponseType as Status};
use super::packet::Packet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapResponse {
    pub message: Packet,
}

impl CoapResponse {
    /// Prepares a 2.05 response matching `request`: piggybacked on an ACK
    /// for a CON request, NON for a NON request. ACK and RST messages get
    /// no response.
    pub fn new(request: &Packet) -> Option<CoapResponse> {
        let mut packet = Packet::new();

        let response_type = match request.header.get_type() {
            MessageType::Confirmable => MessageType::Acknowledgement,
            MessageType::NonConfirmable => MessageType::NonConfirmable,
            _ => return None,
        };
        packet.header.set_type(response_type);
        packet.header.code = MessageClass::Response(Status::Content);
        packet
            .header
            .set_message_id(request.header.get_message_id());
        packet.set_token(request.get_token().to_vec());

        Some(CoapResponse { message: packet })
    }

    pub fn from_packet(message: Packet) -> CoapResponse {
        CoapResponse { message }
    }

    pub fn set_status(&mut self, status: Status) {
        self.message.header.code = MessageClass::Response(status);
    }

    pub fn get_status(&self) -> Option<Status> {
        match self.message.header.code {
            MessageClass::Response(status) => Some(status),
            _ => None,
        }
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.message.payload = payload;
    }
}
