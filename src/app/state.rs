use super::{ComponentState, ServiceManager, COMPONENTS};
use std::collections::HashMap;
use tracing::debug;

impl ServiceManager {
    /// Update component state
    pub async fn set_component_state(&self, component: &str, state: ComponentState) {
        let mut states = self.component_states.lock().await;
        let previous = states.insert(component.to_string(), state.clone());
        if previous.as_ref() != Some(&state) {
            debug!(
                "Component '{}' state changed: {:?} -> {:?}",
                component, previous, state
            );
        }
    }

    pub async fn get_component_state(&self, component: &str) -> Option<ComponentState> {
        let states = self.component_states.lock().await;
        states.get(component).cloned()
    }

    /// Snapshot of every registered component
    pub async fn get_all_component_states(&self) -> HashMap<String, ComponentState> {
        let states = self.component_states.lock().await;
        states.clone()
    }

    /// True once every managed component reports `Running`
    pub async fn is_ready(&self) -> bool {
        let states = self.component_states.lock().await;
        COMPONENTS
            .iter()
            .all(|c| states.get(*c) == Some(&ComponentState::Running))
    }

    /// Components currently marked `Failed`, in start order
    pub async fn failed_components(&self) -> Vec<&'static str> {
        let states = self.component_states.lock().await;
        COMPONENTS
            .iter()
            .copied()
            .filter(|c| states.get(*c) == Some(&ComponentState::Failed))
            .collect()
    }
}
