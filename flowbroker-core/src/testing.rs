//! Scripted stand-in for the process-instance execution state machine, used
//! by the scenario tests. Elements are registered as waiting, consume at most
//! one message (unless repeating), and mutually exclusive elements share a
//! race group of which only one member may ever fire.

use crate::partition::{ElementTrigger, ProcessEngine};
use crate::types::{merge_variables, Key, Variables};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementTransition {
    Activating,
    Activated,
    EventOccurred,
    Completing,
    Completed,
}

#[derive(Clone, Debug)]
pub struct CreatedInstance {
    pub process_instance_key: Key,
    pub process_definition_key: Key,
    pub bpmn_process_id: String,
    pub start_event_id: String,
    pub variables: Variables,
}

#[derive(Clone, Debug)]
struct Element {
    one_shot: bool,
    consumed: bool,
    group: Option<u32>,
    variables: Variables,
    received: Vec<Variables>,
}

#[derive(Default)]
struct Inner {
    elements: BTreeMap<Key, Element>,
    consumed_groups: BTreeSet<u32>,
    lifecycle: Vec<(Key, ElementTransition)>,
    instances: Vec<CreatedInstance>,
}

#[derive(Default)]
pub struct ScriptedProcesses {
    inner: Mutex<Inner>,
}

impl ScriptedProcesses {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a waiting element. `one_shot` elements consume a single
    /// message and complete; repeating ones (non-interrupting boundary
    /// events) stay active and accept every message.
    pub fn register_element(&self, element_instance_key: Key, one_shot: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.elements.insert(
            element_instance_key,
            Element {
                one_shot,
                consumed: false,
                group: None,
                variables: Variables::new(),
                received: Vec::new(),
            },
        );
        inner
            .lifecycle
            .push((element_instance_key, ElementTransition::Activating));
        inner
            .lifecycle
            .push((element_instance_key, ElementTransition::Activated));
    }

    /// Put an element into a race group: the first member to fire consumes
    /// the whole group, later triggers on any member are rejected.
    pub fn set_group(&self, element_instance_key: Key, group: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(element) = inner.elements.get_mut(&element_instance_key) {
            element.group = Some(group);
        }
    }

    /// Seed the element's variable scope (e.g. the instance variables the
    /// correlation key was resolved from).
    pub fn seed_variables(&self, element_instance_key: Key, variables: Variables) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(element) = inner.elements.get_mut(&element_instance_key) {
            element.variables = variables;
        }
    }

    pub fn lifecycle_of(&self, element_instance_key: Key) -> Vec<ElementTransition> {
        let inner = self.inner.lock().unwrap();
        inner
            .lifecycle
            .iter()
            .filter(|(key, _)| *key == element_instance_key)
            .map(|(_, transition)| *transition)
            .collect()
    }

    /// The message variable documents an element received, in order.
    pub fn received_by(&self, element_instance_key: Key) -> Vec<Variables> {
        let inner = self.inner.lock().unwrap();
        inner
            .elements
            .get(&element_instance_key)
            .map(|element| element.received.clone())
            .unwrap_or_default()
    }

    /// The element's variable scope after all merges.
    pub fn variables_of(&self, element_instance_key: Key) -> Variables {
        let inner = self.inner.lock().unwrap();
        inner
            .elements
            .get(&element_instance_key)
            .map(|element| element.variables.clone())
            .unwrap_or_default()
    }

    pub fn instances(&self) -> Vec<CreatedInstance> {
        self.inner.lock().unwrap().instances.clone()
    }
}

#[async_trait]
impl ProcessEngine for ScriptedProcesses {
    async fn correlate_to_element(
        &self,
        _process_instance_key: Key,
        element_instance_key: Key,
        _message_name: &str,
        variables: &Variables,
    ) -> Result<ElementTrigger> {
        let mut inner = self.inner.lock().unwrap();

        let Some(element) = inner.elements.get(&element_instance_key) else {
            return Ok(ElementTrigger::Rejected);
        };
        if element.consumed {
            return Ok(ElementTrigger::Rejected);
        }
        if let Some(group) = element.group {
            if inner.consumed_groups.contains(&group) {
                return Ok(ElementTrigger::Rejected);
            }
        }

        let one_shot = element.one_shot;
        let group = element.group;

        let element = inner
            .elements
            .get_mut(&element_instance_key)
            .expect("present above");
        merge_variables(&mut element.variables, variables);
        element.received.push(variables.clone());
        if one_shot {
            element.consumed = true;
        }

        let mut interrupted = Vec::new();
        if one_shot {
            // The fired element's remaining subscriptions close too.
            interrupted.push(element_instance_key);
            if let Some(group) = group {
                inner.consumed_groups.insert(group);
                let losers: Vec<Key> = inner
                    .elements
                    .iter()
                    .filter(|(key, e)| **key != element_instance_key && e.group == Some(group))
                    .map(|(key, _)| *key)
                    .collect();
                for loser in &losers {
                    if let Some(e) = inner.elements.get_mut(loser) {
                        e.consumed = true;
                    }
                }
                interrupted.extend(losers);
            }
        }

        inner
            .lifecycle
            .push((element_instance_key, ElementTransition::EventOccurred));
        if one_shot {
            inner
                .lifecycle
                .push((element_instance_key, ElementTransition::Completing));
            inner
                .lifecycle
                .push((element_instance_key, ElementTransition::Completed));
        }

        Ok(ElementTrigger::Accepted {
            interrupted_elements: interrupted,
        })
    }

    async fn create_instance_for_start_event(
        &self,
        process_instance_key: Key,
        process_definition_key: Key,
        bpmn_process_id: &str,
        start_event_id: &str,
        variables: &Variables,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.instances.push(CreatedInstance {
            process_instance_key,
            process_definition_key,
            bpmn_process_id: bpmn_process_id.to_string(),
            start_event_id: start_event_id.to_string(),
            variables: variables.clone(),
        });
        Ok(())
    }
}
