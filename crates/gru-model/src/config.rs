//! GRU layer parameters.

use serde::{Deserialize, Serialize};

use gru_core::{GruError, Result};

/// Which way(s) the recurrence walks the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Reverse,
    Bidirectional,
}

impl Direction {
    /// Number of weight sets / hidden vectors.
    pub fn num_directions(self) -> usize {
        match self {
            Direction::Forward | Direction::Reverse => 1,
            Direction::Bidirectional => 2,
        }
    }

    /// Whether weight set `d` walks the sequence backwards.
    pub fn is_reversed(self, d: usize) -> bool {
        match self {
            Direction::Forward => false,
            Direction::Reverse => true,
            Direction::Bidirectional => d == 1,
        }
    }

    /// Numeric code used by the weight file header.
    pub fn code(self) -> u32 {
        match self {
            Direction::Forward => 0,
            Direction::Reverse => 1,
            Direction::Bidirectional => 2,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Direction::Forward),
            1 => Ok(Direction::Reverse),
            2 => Ok(Direction::Bidirectional),
            other => Err(GruError::InvalidConfig(format!("unknown direction code {}", other))),
        }
    }
}

/// Parameters of one GRU layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GruConfig {
    /// Hidden units per direction (H).
    pub num_output: usize,
    /// Features per timestep (I).
    pub input_size: usize,
    pub direction: Direction,
    /// Run the int8 recurrence.
    #[serde(default)]
    pub int8: bool,
}

impl GruConfig {
    pub fn new(num_output: usize, input_size: usize, direction: Direction) -> Self {
        Self {
            num_output,
            input_size,
            direction,
            int8: false,
        }
    }

    pub fn with_int8(mut self, int8: bool) -> Self {
        self.int8 = int8;
        self
    }

    pub fn num_directions(&self) -> usize {
        self.direction.num_directions()
    }

    /// Elements of one direction's `weight_xc` (`3H x I`).
    pub fn weight_xc_len(&self) -> usize {
        3 * self.num_output * self.input_size
    }

    /// Elements of one direction's `weight_hc` (`3H x H`).
    pub fn weight_hc_len(&self) -> usize {
        3 * self.num_output * self.num_output
    }

    /// Elements of one direction's `bias_c` (`4 x H`).
    pub fn bias_len(&self) -> usize {
        4 * self.num_output
    }

    /// Width of one output row (`H * directions`).
    pub fn output_width(&self) -> usize {
        self.num_output * self.num_directions()
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_output == 0 {
            return Err(GruError::InvalidConfig("num_output must be > 0".into()));
        }
        if self.input_size == 0 {
            return Err(GruError::InvalidConfig("input_size must be > 0".into()));
        }
        // Weight counts must fit in the u32 fields of the weight file.
        let block = |a: usize, b: usize| {
            3usize
                .checked_mul(a)
                .and_then(|v| v.checked_mul(b))
                .filter(|&v| u32::try_from(v).is_ok())
        };
        if block(self.num_output, self.input_size).is_none()
            || block(self.num_output, self.num_output).is_none()
        {
            return Err(GruError::InvalidConfig(format!(
                "layer too large: H={} I={}",
                self.num_output, self.input_size
            )));
        }
        Ok(())
    }
}
