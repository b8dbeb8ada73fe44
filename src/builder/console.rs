use crate::builder::{Builder, BuilderError};

use super::assert_not_none;

/// Port name guest agents look for to share the clipboard with the host
pub const CLIPBOARD_AGENT_PORT_NAME: &str = "com.redhat.spice.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolePort {
    pub name: String,
    pub shares_clipboard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleDevice {
    pub ports: Vec<ConsolePort>,
}

#[derive(Debug)]
pub struct ConsolePortBuilder {
    pub name: Option<String>,
    pub shares_clipboard: bool,
}

impl Default for ConsolePortBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsolePortBuilder {
    pub fn new() -> ConsolePortBuilder {
        ConsolePortBuilder {
            name: None,
            shares_clipboard: false,
        }
    }

    /// Port carrying the clipboard agent
    pub fn clipboard_agent() -> ConsolePortBuilder {
        Self::new()
            .with_name(CLIPBOARD_AGENT_PORT_NAME.to_string())
            .sharing_clipboard(true)
    }

    pub fn with_name(mut self, name: String) -> ConsolePortBuilder {
        self.name = Some(name);
        self
    }

    pub fn sharing_clipboard(mut self, shares_clipboard: bool) -> ConsolePortBuilder {
        self.shares_clipboard = shares_clipboard;
        self
    }
}

impl Builder<ConsolePort> for ConsolePortBuilder {
    fn try_build(self) -> Result<ConsolePort, BuilderError> {
        Ok(ConsolePort {
            name: assert_not_none(stringify!(self.name), self.name)?,
            shares_clipboard: self.shares_clipboard,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::console::{ConsolePortBuilder, CLIPBOARD_AGENT_PORT_NAME};
    use crate::builder::Builder;

    #[test]
    fn clipboard_agent_port() {
        let port = ConsolePortBuilder::clipboard_agent().try_build().unwrap();
        assert_eq!(port.name, CLIPBOARD_AGENT_PORT_NAME);
        assert!(port.shares_clipboard);
    }

    #[test]
    #[should_panic]
    fn unnamed_port() {
        ConsolePortBuilder::new()
            .sharing_clipboard(true)
            .try_build()
            .unwrap();
    }
}
