//! Property tests for the work-division calculator.

use portacc_core::{
    get_valid_work_div, is_valid_work_div, AccDevProps, GridBlockExtentSubDivRestrictions, Idx, IdxVec,
};
use proptest::prelude::*;

fn restrictions() -> impl Strategy<Value = GridBlockExtentSubDivRestrictions> {
    prop_oneof![
        Just(GridBlockExtentSubDivRestrictions::EqualExtent),
        Just(GridBlockExtentSubDivRestrictions::CloseToEqualExtent),
        Just(GridBlockExtentSubDivRestrictions::Unrestricted),
    ]
}

fn props_3d() -> impl Strategy<Value = AccDevProps<3>> {
    (
        prop::array::uniform3(1usize..=1024),
        1usize..=1024,
        1usize..=16,
    )
        .prop_map(|(block_max, count_max, sms)| AccDevProps {
            multi_processor_count: sms,
            grid_block_extent_max: IdxVec::all(Idx::MAX),
            grid_block_count_max: Idx::MAX,
            block_thread_extent_max: IdxVec::new(block_max),
            block_thread_count_max: count_max,
            thread_elem_extent_max: IdxVec::all(Idx::MAX),
            thread_elem_count_max: Idx::MAX,
            shared_mem_size_bytes: 0,
        })
}

proptest! {
    #[test]
    fn covers_extent_and_is_valid(
        props in props_3d(),
        extent in prop::array::uniform3(1usize..=3000),
        elems in prop::array::uniform3(1usize..=4),
        force_even in any::<bool>(),
        restriction in restrictions(),
    ) {
        let extent = IdxVec::new(extent);
        let wd = get_valid_work_div(&props, extent, IdxVec::new(elems), force_even, restriction).unwrap();

        prop_assert!(wd.covers(&extent), "{} does not cover {}", wd, extent);
        prop_assert!(is_valid_work_div(&props, &wd));
        prop_assert_eq!(wd.thread_elem_extent(), IdxVec::new(elems));
    }

    #[test]
    fn block_threads_respect_device_limits(
        props in props_3d(),
        extent in prop::array::uniform3(1usize..=5000),
        restriction in restrictions(),
    ) {
        let wd = get_valid_work_div(&props, IdxVec::new(extent), IdxVec::ones(), false, restriction).unwrap();
        let block = wd.block_thread_extent();

        prop_assert!(block.all_le(&props.block_thread_extent_max));
        prop_assert!(block.prod() <= props.block_thread_count_max);
    }

    #[test]
    fn forced_even_division_has_no_partial_blocks(
        props in props_3d(),
        extent in prop::array::uniform3(1usize..=2000),
        restriction in restrictions(),
    ) {
        let extent = IdxVec::new(extent);
        let wd = get_valid_work_div(&props, extent, IdxVec::ones(), true, restriction).unwrap();

        prop_assert_eq!(wd.grid_thread_extent(), extent);
    }

    #[test]
    fn equal_extent_blocks_are_cubes(
        props in props_3d(),
        extent in prop::array::uniform3(1usize..=2000),
        force_even in any::<bool>(),
    ) {
        let wd = get_valid_work_div(
            &props,
            IdxVec::new(extent),
            IdxVec::ones(),
            force_even,
            GridBlockExtentSubDivRestrictions::EqualExtent,
        )
        .unwrap();
        let block = wd.block_thread_extent();

        prop_assert_eq!(block.min_elem(), block.max_elem());
    }

    #[test]
    fn one_dimensional_limits(extent in 1usize..=100_000, block_max in 1usize..=1024) {
        let props = AccDevProps::<1>::from_hw3(
            1,
            IdxVec::new([1, 1, Idx::MAX]),
            IdxVec::new([1, 1, block_max]),
            block_max,
            0,
        );
        let wd = get_valid_work_div(
            &props,
            IdxVec::new([extent]),
            IdxVec::ones(),
            false,
            GridBlockExtentSubDivRestrictions::Unrestricted,
        )
        .unwrap();

        prop_assert_eq!(wd.block_thread_extent()[0], extent.min(block_max));
        prop_assert_eq!(wd.grid_block_extent()[0], extent.div_ceil(extent.min(block_max)));
    }
}
