//! Allocation context close accounting

use graphforge::memory::{ModelArrayStorage, UsageMarker};
use graphforge::{DataType, Tensor};
use proptest::prelude::*;

#[test]
fn test_global_output_is_never_returned_to_the_pool() {
    let storage = ModelArrayStorage::new("global", true);
    let pool = storage.pool::<f32>().unwrap();
    let before = pool.free_count(4);

    let ctx = storage.create_context().unwrap();
    let array = ctx.get_array::<f32>(&[4, 4], false).unwrap();
    array.mark_global_output();
    let summary = ctx.close();

    assert_eq!(summary.retained_blocks, 4);
    assert_eq!(pool.free_count(4), before);
    assert!(array.markers().iter().all(|m| *m == UsageMarker::GlobalOutput));
}

#[test]
fn test_output_view_pins_the_whole_array() {
    let storage = ModelArrayStorage::new("view", true);
    let ctx = storage.create_context().unwrap();
    let tensor = ctx.get_tensor("t", DataType::Float64, &[4, 8], true).unwrap();
    let row = tensor.view(&[2]).unwrap();
    row.mark_output();
    drop(tensor);

    let summary = ctx.close();
    // One block is an output, so the array keeps all four
    assert_eq!(summary.retained_blocks, 4);
    assert_eq!(summary.recycled_blocks, 0);
    assert_eq!(row.to_f64_vec().unwrap(), vec![0.0; 8]);
}

#[test]
fn test_closed_context_refuses_allocation() {
    let storage = ModelArrayStorage::new("closed", true);
    let ctx = storage.create_context().unwrap();
    ctx.close();
    let err = ctx.get_tensor("late", DataType::Int8, &[2], false).unwrap_err();
    assert!(err.is_internal_error());
}

#[test]
fn test_context_outlives_storage_close() {
    let storage = ModelArrayStorage::new("late", true);
    let ctx = storage.create_context().unwrap();
    drop(ctx.get_array::<u16>(&[2, 2], false).unwrap());
    storage.close();

    let summary = ctx.close();
    assert_eq!(summary.recycled_blocks, 0);
    assert_eq!(summary.dropped_blocks, 2);
    assert!(storage.stats().per_type.is_empty());
}

#[derive(Debug, Clone, Copy)]
enum Fate {
    Dropped,
    Output,
    Global,
    Held,
}

fn any_fate() -> impl Strategy<Value = Fate> {
    prop_oneof![
        Just(Fate::Dropped),
        Just(Fate::Output),
        Just(Fate::Global),
        Just(Fate::Held),
    ]
}

proptest! {
    #[test]
    fn test_close_accounts_for_every_block(
        arrays in proptest::collection::vec((1usize..5, 1usize..9, any_fate()), 0..16)
    ) {
        let storage = ModelArrayStorage::new("complete", true);
        let pool = storage.pool::<i64>().unwrap();
        let ctx = storage.create_context().unwrap();

        let mut held = Vec::new();
        let mut promoted = 0;
        for (rows, cols, fate) in arrays {
            let tensor = Tensor::from_array("a", ctx.get_array::<i64>(&[rows, cols], false).unwrap());
            match fate {
                Fate::Dropped => {}
                Fate::Output => {
                    promoted += tensor.blocks_num();
                    ctx.mark_output(&tensor);
                    held.push(tensor);
                }
                Fate::Global => {
                    promoted += tensor.blocks_num();
                    ctx.mark_global_output(&tensor);
                    held.push(tensor);
                }
                Fate::Held => held.push(tensor),
            }
        }

        let free_before = pool.total_free();
        let summary = ctx.close();
        prop_assert_eq!(summary.total(), ctx.produced_blocks());
        prop_assert_eq!(summary.retained_blocks, promoted);
        prop_assert_eq!(pool.total_free(), free_before + summary.recycled_blocks);
    }
}
