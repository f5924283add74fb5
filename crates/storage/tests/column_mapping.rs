use ledgerd_storage::Column;

#[test]
fn column_positions_follow_all() {
    let mut seen = 0u32;
    for (position, column) in Column::ALL.iter().copied().enumerate() {
        assert_eq!(column.index(), position);
        assert_eq!(seen & column.bit(), 0, "duplicate bit for {column:?}");
        seen |= column.bit();
    }
    assert_eq!(seen.count_ones() as usize, Column::ALL.len());
}

#[test]
fn only_block_index_and_meta_are_authoritative() {
    let authoritative: Vec<Column> = Column::ALL
        .iter()
        .copied()
        .filter(|column| !column.is_derived())
        .collect();
    assert_eq!(authoritative, vec![Column::BlockIndex, Column::Meta]);
    assert!(Column::TxIndex.is_derived());
    assert!(Column::AddressIndex.is_derived());
}

#[test]
fn partition_names_are_distinct() {
    let mut names: Vec<&str> = Column::ALL.iter().map(|column| column.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), Column::ALL.len());
}
