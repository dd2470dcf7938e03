//! Declarative boot topology.
//!
//! One [`BootRecipe`] per [`ClientType`] says which worker kind fills each
//! table, how big each table is and which routing discipline binds it. The
//! engine evaluates the recipe with a single generic boot routine.

use serde::Serialize;

use super::options::{ClientType, EngineOptions};
use crate::core::state::WorkerKind;

/// How a router distributes data across its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Discipline {
    /// Delivers bus traffic to the consumer slot named by each message.
    Consumer,
    /// One bound producer slot per lane, failing over on error.
    Serial,
    /// Every active producer slot shares the load.
    Pool,
}

/// Where a table's slot count comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSize {
    Fixed(usize),
    ConsumerOption,
    ProducerOption,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableRecipe {
    pub kind: WorkerKind,
    pub size: TableSize,
    pub discipline: Discipline,
}

impl TableRecipe {
    pub fn slots(&self, options: &EngineOptions) -> usize {
        match self.size {
            TableSize::Fixed(n) => n,
            TableSize::ConsumerOption => options.c_table_size,
            TableSize::ProducerOption => options.p_table_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BootRecipe {
    pub consumer: TableRecipe,
    pub producer: TableRecipe,
}

// Desktop peers do not share connectivity: their consumer table carries only
// the local application stream, whatever `c_table_size` says.
const DESKTOP: BootRecipe = BootRecipe {
    consumer: TableRecipe {
        kind: WorkerKind::LocalStream,
        size: TableSize::Fixed(1),
        discipline: Discipline::Consumer,
    },
    producer: TableRecipe {
        kind: WorkerKind::RealtimeConsumer,
        size: TableSize::ProducerOption,
        discipline: Discipline::Serial,
    },
};

const WIDGET: BootRecipe = BootRecipe {
    consumer: TableRecipe {
        kind: WorkerKind::RealtimeProducer,
        size: TableSize::ConsumerOption,
        discipline: Discipline::Consumer,
    },
    producer: TableRecipe {
        kind: WorkerKind::RelayConsumer,
        size: TableSize::ProducerOption,
        discipline: Discipline::Pool,
    },
};

impl BootRecipe {
    pub fn for_client(client_type: ClientType) -> Self {
        match client_type {
            ClientType::Desktop => DESKTOP,
            ClientType::Widget => WIDGET,
        }
    }

    /// Worker kinds the recipe needs connectors for.
    pub fn kinds(&self) -> [WorkerKind; 2] {
        [self.consumer.kind, self.producer.kind]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desktop_pins_a_single_local_stream() {
        let options = EngineOptions {
            c_table_size: 7,
            p_table_size: 3,
            ..Default::default()
        };
        let recipe = BootRecipe::for_client(ClientType::Desktop);
        assert_eq!(recipe.consumer.kind, WorkerKind::LocalStream);
        assert_eq!(recipe.consumer.slots(&options), 1);
        assert_eq!(recipe.producer.slots(&options), 3);
        assert_eq!(recipe.producer.discipline, Discipline::Serial);
    }

    #[test]
    fn widget_shares_over_realtime_and_pools_the_relay() {
        let options = EngineOptions::default();
        let recipe = BootRecipe::for_client(ClientType::Widget);
        assert_eq!(recipe.kinds(), [WorkerKind::RealtimeProducer, WorkerKind::RelayConsumer]);
        assert_eq!(recipe.consumer.slots(&options), options.c_table_size);
        assert_eq!(recipe.producer.discipline, Discipline::Pool);
    }

    #[test]
    fn every_recipe_faces_the_right_way() {
        for client in [ClientType::Desktop, ClientType::Widget] {
            let recipe = BootRecipe::for_client(client);
            assert!(recipe.consumer.kind.faces_consumers());
            assert!(!recipe.producer.kind.faces_consumers());
        }
    }
}
