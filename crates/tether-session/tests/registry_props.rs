//! Property tests for the registry's table-disjointness invariant.

use std::any::Any;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use proptest::prelude::*;

use tether_session::{Endpoint, EndpointConfig, InvokeFault, SubjectStub};
use tether_wire::{GrainId, PayloadReader};

struct NullStub {
    marker: Arc<()>,
}

impl NullStub {
    fn new() -> Arc<dyn SubjectStub> {
        Arc::new(Self {
            marker: Arc::new(()),
        })
    }
}

impl SubjectStub for NullStub {
    fn interface_name(&self) -> &str {
        "INull"
    }

    fn subject(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.marker) as Arc<dyn Any + Send + Sync>
    }

    fn invoke<'a>(
        &'a self,
        _method: &'a str,
        _args: PayloadReader<'a>,
    ) -> BoxFuture<'a, Result<Vec<u8>, InvokeFault>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

#[derive(Debug, Clone)]
enum Op {
    CreateServant(u64),
    CreateProxy(u64),
    GetOrCreateProxy(u64),
    GetOrCreateServant,
    RemoveServant(u64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    // A small id space so operations collide often.
    let id = 1u64..16;
    prop_oneof![
        id.clone().prop_map(Op::CreateServant),
        id.clone().prop_map(Op::CreateProxy),
        id.clone().prop_map(Op::GetOrCreateProxy),
        Just(Op::GetOrCreateServant),
        id.prop_map(Op::RemoveServant),
    ]
}

proptest! {
    #[test]
    fn no_grain_id_ever_lives_in_both_tables(ops in proptest::collection::vec(arb_op(), 1..64)) {
        let endpoint = Endpoint::new(EndpointConfig::default());
        let registry = endpoint.registry();

        for op in ops {
            match op {
                Op::CreateServant(id) => {
                    let _ = registry.create_servant(GrainId::new(id), NullStub::new());
                }
                Op::CreateProxy(id) => {
                    let _ = registry.create_proxy(GrainId::new(id), "INull");
                }
                Op::GetOrCreateProxy(id) => {
                    let _ = registry.get_or_create_proxy(GrainId::new(id), "INull");
                }
                Op::GetOrCreateServant => {
                    let _ = registry.get_or_create_servant(NullStub::new());
                }
                Op::RemoveServant(id) => {
                    let _ = registry.remove_servant(GrainId::new(id));
                }
            }
            prop_assert!(registry.tables_are_disjoint());
        }
    }
}
