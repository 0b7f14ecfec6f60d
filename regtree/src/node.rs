/*!
Tree node variants.
*/

use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::device::DeviceNode;
use crate::error::Result;
use crate::variable::{validate_name, Variable};

pub type CommandFn = Arc<dyn Fn(Option<&str>) -> Result<()> + Send + Sync>;

/// Named callable taking an optional text argument
pub struct Command {
    name: String,
    description: String,
    function: CommandFn,
}

impl Command {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        function: impl Fn(Option<&str>) -> Result<()> + Send + Sync + 'static,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Arc::new(Self {
            name,
            description: description.into(),
            function: Arc::new(function),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn call(&self, arg: Option<&str>) -> Result<()> {
        info!("▶️ Command {} ({:?})", self.name, arg);
        (self.function)(arg)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command").field("name", &self.name).finish()
    }
}

/// Child of a device
#[derive(Clone)]
pub enum Node {
    Device(Arc<dyn DeviceNode>),
    Variable(Arc<Variable>),
    Command(Arc<Command>),
}

impl Node {
    pub fn name(&self) -> String {
        match self {
            Self::Device(d) => d.device().name().to_string(),
            Self::Variable(v) => v.name().to_string(),
            Self::Command(c) => c.name().to_string(),
        }
    }

    pub fn as_device(&self) -> Option<&Arc<dyn DeviceNode>> {
        match self {
            Self::Device(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_variable(&self) -> Option<&Arc<Variable>> {
        match self {
            Self::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_command(&self) -> Option<&Arc<Command>> {
        match self {
            Self::Command(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(d) => write!(f, "Device({})", d.device().path()),
            Self::Variable(v) => write!(f, "Variable({})", v.path()),
            Self::Command(c) => write!(f, "Command({})", c.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_command_call() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let cmd = Command::new("pulse", "Count calls", move |arg| {
            counter.fetch_add(arg.map(|a| a.len()).unwrap_or(1), Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        cmd.call(None).unwrap();
        cmd.call(Some("abc")).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 4);

        let node = Node::Command(cmd);
        assert_eq!(node.name(), "pulse");
        assert!(node.as_variable().is_none());
    }

    #[test]
    fn test_command_name_checked() {
        assert!(matches!(
            Command::new("bad name", "", |_| Ok(())),
            Err(RegError::Node(_))
        ));
    }
}
