/// Separator between channel readings on the wire.
pub const FIELD_DELIMITER: &str = ", ";

/// Widest single reading a sensor board is expected to print.
pub const MAX_FIELD_WIDTH: usize = 32;

/// Longest line that can still hold `num_channels` readings.
pub fn max_line_len(num_channels: usize) -> usize {
    num_channels.max(1) * (MAX_FIELD_WIDTH + FIELD_DELIMITER.len())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("UTF-8 conversion error: {0}")]
    Decode(#[from] std::str::Utf8Error),

    #[error("Reading {index} is not a finite number: '{field}'")]
    InvalidField { index: usize, field: String },

    #[error("Expected {expected} readings, but received {actual} readings: '{raw}'")]
    FieldCount {
        expected: usize,
        actual: usize,
        raw: String,
    },
}

impl FrameError {
    /// Whether the line had the wrong shape, as opposed to unreadable content.
    pub fn is_malformed_frame(&self) -> bool {
        matches!(self, Self::FieldCount { .. })
    }
}

/// One sample per channel, in channel order.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    values: Vec<f64>,
}

impl Frame {
    /// Parse one received line holding exactly `num_channels` readings.
    ///
    /// The field count is checked before any field is parsed, so a truncated
    /// or doubled line is always reported as [`FrameError::FieldCount`]. A
    /// blank line holds no readings at all, whatever the channel count.
    pub fn parse(raw: &[u8], num_channels: usize) -> Result<Self, FrameError> {
        let line = std::str::from_utf8(raw)?.trim();

        let fields: Vec<&str> = if line.is_empty() {
            Vec::new()
        } else {
            line.split(FIELD_DELIMITER).collect()
        };
        if fields.len() != num_channels {
            return Err(FrameError::FieldCount {
                expected: num_channels,
                actual: fields.len(),
                raw: line.to_string(),
            });
        }

        let values = fields
            .iter()
            .enumerate()
            .map(|(index, field)| {
                field
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite())
                    .ok_or_else(|| FrameError::InvalidField {
                        index,
                        field: (*field).to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { values })
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }
}
