//! Devices attached with the same settings to every VM.

/// Size of the single scanout of the graphics device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayResolution {
    pub width: u32,
    pub height: u32,
}

impl Default for DisplayResolution {
    fn default() -> Self {
        DisplayResolution {
            width: 1920,
            height: 1200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsDevice {
    pub scanouts: Vec<DisplayResolution>,
}

impl GraphicsDevice {
    pub fn single_display(resolution: DisplayResolution) -> Self {
        GraphicsDevice {
            scanouts: vec![resolution],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioStream {
    /// Fed by the host default input
    Input,
    /// Played on the host default output
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    pub streams: Vec<AudioStream>,
}

impl AudioDevice {
    pub fn input() -> Self {
        AudioDevice {
            streams: vec![AudioStream::Input],
        }
    }

    pub fn output() -> Self {
        AudioDevice {
            streams: vec![AudioStream::Output],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyboard {
    Usb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointingDevice {
    /// Absolute pointer following the host cursor
    UsbScreenCoordinate,
}
