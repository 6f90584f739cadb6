//! The endpoint topology model surfaced by UMP Stream discovery.

use serde::{Deserialize, Serialize};

/// Which way MIDI flows through a Function Block, seen from the endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockDirection {
    Input,
    Output,
    Bidirectional,
}

impl BlockDirection {
    pub fn to_bits(self) -> u8 {
        match self {
            BlockDirection::Input => 0b01,
            BlockDirection::Output => 0b10,
            BlockDirection::Bidirectional => 0b11,
        }
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => BlockDirection::Input,
            0b10 => BlockDirection::Output,
            _ => BlockDirection::Bidirectional,
        }
    }
}

/// MIDI 1.0 compatibility mode of a Function Block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Midi1Mode {
    None,
    Midi1Only,
    /// MIDI 1.0 restricted to the classic 31.25 kbit/s bandwidth.
    Midi1LowSpeed,
}

impl Midi1Mode {
    pub fn to_bits(self) -> u8 {
        match self {
            Midi1Mode::None => 0,
            Midi1Mode::Midi1Only => 1,
            Midi1Mode::Midi1LowSpeed => 2,
        }
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            1 => Midi1Mode::Midi1Only,
            2 => Midi1Mode::Midi1LowSpeed,
            _ => Midi1Mode::None,
        }
    }
}

/// A logical sub-unit of an endpoint spanning a contiguous group range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionBlock {
    pub id: u8,
    pub name: String,
    pub direction: BlockDirection,
    #[serde(default)]
    pub ui_hint: u8,
    pub first_group: u8,
    pub num_groups: u8,
    #[serde(default = "default_midi1_mode")]
    pub midi1_mode: Midi1Mode,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_midi1_mode() -> Midi1Mode {
    Midi1Mode::None
}

fn default_true() -> bool {
    true
}

impl FunctionBlock {
    /// Checks the block's structural invariants: id 0..=31, ui hint 0..=3,
    /// a non-empty group span that stays inside the 16 groups.
    pub fn validate(&self) -> Result<(), String> {
        if self.id > 31 {
            return Err(format!("function block id {} out of range", self.id));
        }
        if self.ui_hint > 3 {
            return Err(format!("ui hint {} out of range", self.ui_hint));
        }
        if self.num_groups == 0 || self.num_groups > 16 {
            return Err(format!("num_groups {} out of range", self.num_groups));
        }
        if self.first_group > 15 {
            return Err(format!("first_group {} out of range", self.first_group));
        }
        if self.first_group as u16 + self.num_groups as u16 > 16 {
            return Err(format!(
                "block {} spans groups {}..{} past group 15",
                self.id,
                self.first_group,
                self.first_group as u16 + self.num_groups as u16 - 1
            ));
        }
        Ok(())
    }
}

/// Identity bytes reported by a Device Identity Notification.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub manufacturer: [u8; 3],
    pub family: u16,
    pub model: u16,
    pub revision: [u8; 4],
}

/// Everything discovery can learn about an endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointTopology {
    pub name: String,
    pub product_instance_id: String,
    pub ump_version: (u8, u8),
    pub supports_midi1_protocol: bool,
    pub supports_midi2_protocol: bool,
    pub supports_jr_tx: bool,
    pub supports_jr_rx: bool,
    #[serde(default)]
    pub device_identity: DeviceIdentity,
    #[serde(default)]
    pub function_blocks: Vec<FunctionBlock>,
}

impl Default for EndpointTopology {
    fn default() -> Self {
        EndpointTopology {
            name: String::new(),
            product_instance_id: String::new(),
            ump_version: (1, 1),
            supports_midi1_protocol: true,
            supports_midi2_protocol: true,
            supports_jr_tx: false,
            supports_jr_rx: false,
            device_identity: DeviceIdentity::default(),
            function_blocks: Vec::new(),
        }
    }
}

impl EndpointTopology {
    pub fn validate(&self) -> Result<(), String> {
        if self.function_blocks.len() > 32 {
            return Err(format!(
                "{} function blocks, at most 32 allowed",
                self.function_blocks.len()
            ));
        }
        for block in &self.function_blocks {
            block.validate()?;
        }
        Ok(())
    }

    pub fn function_block(&self, id: u8) -> Option<&FunctionBlock> {
        self.function_blocks.iter().find(|b| b.id == id)
    }
}
