use std::collections::HashMap;

use graphbridge_core::{BindingDesc, BridgeError, BridgeResult, CompiledGraph};

/// Name to tensor-slot map captured from a compiled graph. Keyed by the
/// names the graph advertises, not by the model configuration.
#[derive(Clone, Debug, Default)]
pub struct BindingTable {
    inputs: HashMap<String, BindingDesc>,
    outputs: HashMap<String, BindingDesc>,
}

impl BindingTable {
    pub fn from_compiled<C: CompiledGraph + ?Sized>(compiled: &C) -> BridgeResult<Self> {
        Ok(Self {
            inputs: index_bindings(compiled.inputs(), "input")?,
            outputs: index_bindings(compiled.outputs(), "output")?,
        })
    }

    pub fn input(&self, name: &str) -> BridgeResult<&BindingDesc> {
        self.inputs.get(name).ok_or_else(|| {
            BridgeError::Unsupported(format!("input '{name}' is not bound in the compiled graph"))
        })
    }

    pub fn output(&self, name: &str) -> BridgeResult<&BindingDesc> {
        self.outputs.get(name).ok_or_else(|| {
            BridgeError::Unsupported(format!("output '{name}' is not bound in the compiled graph"))
        })
    }

    /// Names of every bound input, in no particular order.
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.keys().map(String::as_str)
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }
}

fn index_bindings(descs: &[BindingDesc], what: &str) -> BridgeResult<HashMap<String, BindingDesc>> {
    let mut map = HashMap::with_capacity(descs.len());
    for desc in descs {
        if map.insert(desc.name.0.clone(), desc.clone()).is_some() {
            return Err(BridgeError::Internal(format!(
                "compiled graph advertises {what} '{}' more than once",
                desc.name
            )));
        }
    }
    Ok(map)
}
