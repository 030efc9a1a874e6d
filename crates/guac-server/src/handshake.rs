//! guacd handshake.
//!
//! Implements the client side of the guacd connection handshake:
//! 1. Gateway sends `select` with the connection type
//! 2. guacd replies with the list of attribute names it needs (normally `args`)
//! 3. Gateway sends `size`, `audio`, `video`, `image`
//! 4. Gateway sends one instruction holding the value of every requested
//!    attribute, in the order they were requested
//!
//! The opcode of guacd's request is looked up like any other attribute, so
//! the `args = "connect"` default turns step 4 into a `connect` instruction.

use guac_core::{encode, ConnectionSettings, Instruction, QueryParams};

/// Query parameter listing audio mimetypes the browser can play.
pub const AUDIO_PARAM: &str = "GUAC_AUDIO";
/// Query parameter listing video mimetypes the browser can play.
pub const VIDEO_PARAM: &str = "GUAC_VIDEO";

/// Media support advertised by the browser in the query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCapabilities {
    pub audio: Vec<String>,
    pub video: Vec<String>,
}

impl ClientCapabilities {
    pub fn from_query(query: &QueryParams) -> Self {
        Self {
            audio: query.values(AUDIO_PARAM).to_vec(),
            video: query.values(VIDEO_PARAM).to_vec(),
        }
    }
}

/// Everything needed to answer guacd's handshake for one session.
#[derive(Debug, Clone)]
pub struct Handshake {
    settings: ConnectionSettings,
    capabilities: ClientCapabilities,
}

impl Handshake {
    pub fn new(settings: ConnectionSettings, capabilities: ClientCapabilities) -> Self {
        Self {
            settings,
            capabilities,
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// The `select` instruction sent as soon as the socket connects.
    pub fn select(&self) -> Vec<u8> {
        let connection_type = self.settings.connection_type.map(|t| t.as_str());
        encode([Some("select"), connection_type])
    }

    /// Encoded reply instructions for guacd's attribute request, in send order.
    pub fn reply(&self, requested: &Instruction) -> Vec<Vec<u8>> {
        let dims = self.settings.dimensions;
        let size = encode([
            Some("size".to_string()),
            Some(dims.width.to_string()),
            Some(dims.height.to_string()),
            Some(dims.dpi.to_string()),
        ]);
        let audio = media_instruction("audio", &self.capabilities.audio);
        let video = media_instruction("video", &self.capabilities.video);
        let image = encode([Some("image")]);

        let values = encode(
            requested
                .fields()
                .iter()
                .map(|name| self.settings.parameter(name)),
        );

        vec![size, audio, video, image, values]
    }
}

fn media_instruction(opcode: &str, mimetypes: &[String]) -> Vec<u8> {
    encode(std::iter::once(Some(opcode)).chain(mimetypes.iter().map(|m| Some(m.as_str()))))
}
