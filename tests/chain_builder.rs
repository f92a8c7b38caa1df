//! Building acquisition trees and splitting them into iterators.

mod common;

use acq_chain::acquisition::AcqParams;
use acq_chain::{AcqError, Advance, Chain};
use common::{Journal, Recorder, RecordingPreset};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

#[test]
fn test_re_adding_same_edge_is_noop() {
    let journal = Journal::new();
    let master = Recorder::new("M", &journal).master(AcqParams::new());
    let slave = Recorder::new("S", &journal).device(AcqParams::new());

    let mut chain = Chain::new();
    assert_ok!(chain.add(&master, &slave));
    assert_ok!(chain.add(&master, &slave));

    assert_eq!(chain.nodes().len(), 2);
    assert_eq!(chain.top_masters(), vec![master.clone()]);
    let node = chain.tree().node_of(&master).unwrap();
    assert_eq!(chain.tree().child_objects(node), vec![slave]);
}

#[test]
fn test_second_master_is_rejected() {
    let journal = Journal::new();
    let m1 = Recorder::new("M1", &journal).master(AcqParams::new());
    let m2 = Recorder::new("M2", &journal).master(AcqParams::new());
    let slave = Recorder::new("S", &journal).device(AcqParams::new());

    let mut chain = Chain::new();
    chain.add(&m1, &slave).unwrap();
    let err = assert_err!(chain.add(&m2, &slave));
    match err {
        AcqError::Configuration(message) => assert!(message.contains("M1"), "{}", message),
        other => panic!("unexpected error: {other}"),
    }

    // nothing moved
    let node = chain.tree().node_of(&slave).unwrap();
    let parent = chain.tree().parent(node).unwrap();
    assert_eq!(chain.tree().object(parent), Some(&m1));
}

#[test]
fn test_reparent_moves_the_subtree() {
    let journal = Journal::new();
    let m1 = Recorder::new("M1", &journal).master(AcqParams::new());
    let m2 = Recorder::new("M2", &journal).master(AcqParams::new());
    let sub = Recorder::new("SUB", &journal).master(AcqParams::new());
    let leaf = Recorder::new("LEAF", &journal).device(AcqParams::new());

    let mut chain = Chain::new();
    chain.add(&m1, &sub).unwrap();
    chain.add(&sub, &leaf).unwrap();
    chain.add(&m2, &Recorder::new("OTHER", &journal).device(AcqParams::new())).unwrap();

    chain.reparent(&m2, &sub).unwrap();

    let tree = chain.tree();
    let sub_node = tree.node_of(&sub).unwrap();
    assert_eq!(tree.object(tree.parent(sub_node).unwrap()), Some(&m2));
    assert_eq!(tree.depth(tree.node_of(&leaf).unwrap()), 3);
}

#[test]
fn test_top_level_master_becomes_slave() {
    let journal = Journal::new();
    let outer = Recorder::new("outer", &journal).master(AcqParams::new());
    let inner = Recorder::new("inner", &journal).master(AcqParams::new());
    let device = Recorder::new("dev", &journal).device(AcqParams::new());

    let mut chain = Chain::new();
    chain.add(&inner, &device).unwrap();
    chain.add(&outer, &inner).unwrap();

    assert_eq!(chain.top_masters(), vec![outer]);
    assert_eq!(chain.nodes().len(), 3);
    let rendered = chain.to_string();
    assert!(rendered.contains("outer"));
    assert!(rendered.contains("        └── dev"), "{}", rendered);
}

#[test]
fn test_presets_and_stoppers_need_top_level_master() {
    let journal = Journal::new();
    let top = Recorder::new("top", &journal).master(AcqParams::new());
    let nested = Recorder::new("nested", &journal).master(AcqParams::new());

    let mut chain = Chain::new();
    chain.add(&top, &nested).unwrap();

    let preset = Arc::new(RecordingPreset::new("p", &journal));
    assert_ok!(chain.add_preset_for(&top, preset.clone()));
    assert!(matches!(
        chain.add_preset_for(&nested, preset),
        Err(AcqError::Configuration(_))
    ));

    assert!(chain.is_stopper(&top));
    assert_ok!(chain.set_stopper(&top, false));
    assert!(!chain.is_stopper(&top));
    assert_err!(chain.set_stopper(&nested, false));
}

#[test]
fn test_append_merges_edges() {
    let journal = Journal::new();
    let m1 = Recorder::new("M1", &journal).master(AcqParams::new());
    let m2 = Recorder::new("M2", &journal).master(AcqParams::new());
    let d1 = Recorder::new("D1", &journal).device(AcqParams::new());
    let d2 = Recorder::new("D2", &journal).device(AcqParams::new());

    let mut chain = Chain::new();
    chain.add(&m1, &d1).unwrap();

    let mut other = Chain::new();
    other.add(&m2, &d2).unwrap();
    other.add_preset(Arc::new(RecordingPreset::new("other", &journal)));

    chain.append(&other, false).unwrap();
    assert_eq!(chain.top_masters(), vec![m1, m2]);
    assert_eq!(chain.nodes().len(), 4);
}

#[tokio::test]
async fn test_empty_chain_has_nothing_to_iterate() {
    let chain = Chain::new();
    assert!(chain.iter_list().is_empty());

    let mut it = chain.iter();
    assert_eq!(assert_ok!(it.next().await), Advance::Exhausted);
    assert!(it.is_finished());
}

#[tokio::test]
async fn test_iter_list_gives_chain_presets_to_first_iterator() {
    let journal = Journal::new();
    let m1 = Recorder::new("M1", &journal).master(AcqParams::new());
    let m2 = Recorder::new("M2", &journal).master(AcqParams::new());

    let mut chain = Chain::new();
    chain
        .add(&m1, &Recorder::new("D1", &journal).device(AcqParams::new()))
        .unwrap();
    chain
        .add(&m2, &Recorder::new("D2", &journal).device(AcqParams::new()))
        .unwrap();
    chain.add_preset(Arc::new(RecordingPreset::new("global", &journal)));
    chain
        .add_preset_for(&m2, Arc::new(RecordingPreset::new("second", &journal)))
        .unwrap();

    let mut iterators = chain.iter_list();
    assert_eq!(iterators.len(), 2);
    assert_eq!(iterators[0].top_master(), Some("M1"));
    assert_eq!(iterators[1].top_master(), Some("M2"));
    assert_eq!(iterators[1].tree().len(), 2);

    for it in iterators.iter_mut() {
        assert_eq!(it.next().await.unwrap(), Advance::Point);
        it.prepare().await.unwrap();
        it.start().await.unwrap();
        it.stop().await.unwrap();
    }

    assert_eq!(journal.count("global", "prepare"), 1);
    assert_eq!(journal.count("global", "stop"), 1);
    assert_eq!(journal.count("second", "prepare"), 1);
    // the chain preset ran with M1's iterator
    assert!(journal.first("global", "prepare") < journal.first("M2", "prepare"));
}
