//! Relationship maintenance and cascading deletion.
//!
//! The model mirrors a small code index:
//!
//! ```text
//! File ──owns──▶ Type ──superclass──▶ Signature (ref counted, abstract)
//!                                        ├── TypeId
//!                                        └── Variant
//! ```

// Test code is allowed to use unwrap for simplicity
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{collections::HashMap, sync::Arc};

use nd_store::{
    Address, ChunkCache, DatabaseConfig, FieldInt, FieldManyToOne, FieldOneToMany, FieldString,
    IntegrityChecker, Nd, NdRecord, NdWriteLock, POOL_FIRST_NODE_TYPE, POOL_GROWABLE_ARRAY,
    SchemaBuilder, StructDef,
};
use rand::{Rng, SeedableRng, rngs::StdRng};

macro_rules! record {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        struct $name(Address);

        impl NdRecord for $name {
            fn from_address(address: Address) -> Self {
                $name(address)
            }

            fn address(&self) -> Address {
                self.0
            }
        }
    };
}

record!(File);
record!(Type);
record!(Signature);

struct Model {
    file: StructDef<File>,
    file_name: FieldString,
    file_types: FieldOneToMany<Type>,
    type_def: StructDef<Type>,
    type_file: FieldManyToOne<File>,
    type_superclass: FieldManyToOne<Signature>,
    type_modifiers: FieldInt,
    signature_users: FieldOneToMany<Type>,
    signature_name: FieldString,
    type_id: StructDef<Signature>,
    variant: StructDef<Signature>,
}

fn model() -> (Model, Arc<nd_store::Schema>) {
    let mut b = SchemaBuilder::new();

    let signature = b.create_abstract_struct::<Signature>("Signature", None);
    let signature_users = FieldOneToMany::<Type>::create(&mut b, signature, 2);
    let signature_name = b.add_string(signature);
    b.use_standard_ref_counting(signature);
    b.done(signature);

    let type_id = b.create_struct::<Signature>("TypeId", Some(signature.id()));
    let _hash = b.add_int(type_id);
    b.done(type_id);
    let variant = b.create_struct::<Signature>("Variant", Some(signature.id()));
    b.done(variant);

    let file = b.create_struct::<File>("File", None);
    let file_name = b.add_string(file);
    let file_types = FieldOneToMany::<Type>::create(&mut b, file, 2);
    b.done(file);

    let type_def = b.create_struct::<Type>("Type", None);
    let type_file = FieldManyToOne::<File>::create_owner(&mut b, type_def, file_types);
    let type_superclass = FieldManyToOne::<Signature>::create(&mut b, type_def, signature_users);
    let type_modifiers = b.add_int(type_def);
    b.done(type_def);

    let schema = Arc::new(b.build().unwrap());
    let model = Model {
        file,
        file_name,
        file_types,
        type_def,
        type_file,
        type_superclass,
        type_modifiers,
        signature_users,
        signature_name,
        type_id,
        variant,
    };
    (model, schema)
}

fn open(schema: Arc<nd_store::Schema>) -> Nd {
    Nd::open_in_memory(Arc::new(ChunkCache::new(512)), schema, DatabaseConfig::default()).unwrap()
}

fn new_type(m: &Model, w: &mut NdWriteLock<'_>, file: File) -> Type {
    let t = w.create(m.type_def).unwrap();
    m.type_file.put(w, t.0, Some(file)).unwrap();
    t
}

fn assert_indices_consistent(m: &Model, w: &NdWriteLock<'_>, signature: Signature) {
    let users = m.signature_users.as_list(w, signature.0).unwrap();
    for (i, user) in users.iter().enumerate() {
        assert_eq!(m.type_superclass.get(w, user.0).unwrap(), Some(signature));
        assert_eq!(m.type_superclass.index(w, user.0).unwrap(), i);
    }
}

#[test]
fn test_many_to_one_moves_between_lists() {
    let (m, schema) = model();
    let nd = open(schema);
    let mut w = nd.acquire_write_lock().unwrap();

    let file = w.create(m.file).unwrap();
    let t = new_type(&m, &mut w, file);
    let keep = new_type(&m, &mut w, file);
    let a = w.create(m.type_id).unwrap();
    let b = w.create(m.type_id).unwrap();
    m.type_superclass.put(&mut w, keep.0, Some(a)).unwrap();

    m.type_superclass.put(&mut w, t.0, Some(a)).unwrap();
    assert_eq!(m.signature_users.as_list(&w, a.0).unwrap(), vec![keep, t]);

    m.type_superclass.put(&mut w, t.0, Some(b)).unwrap();
    assert_eq!(m.signature_users.as_list(&w, a.0).unwrap(), vec![keep]);
    assert_eq!(m.signature_users.as_list(&w, b.0).unwrap(), vec![t]);
    assert_eq!(m.type_superclass.get(&w, t.0).unwrap(), Some(b));

    m.type_superclass.put(&mut w, t.0, None).unwrap();
    assert!(m.signature_users.is_empty(&w, b.0).unwrap());
    assert!(!m.signature_users.as_list(&w, a.0).unwrap().contains(&t));
    assert_eq!(m.type_superclass.get(&w, t.0).unwrap(), None);
    assert!(m.type_superclass.get_address(&w, t.0).unwrap().is_null());

    // b lost its only user and is reference counted through its base struct.
    assert!(w.is_pending_deletion(b.0));
    assert!(!w.is_pending_deletion(a.0));
}

#[test]
fn test_swap_remove_keeps_back_indices() {
    let (m, schema) = model();
    let nd = open(schema);
    let mut w = nd.acquire_write_lock().unwrap();

    let file = w.create(m.file).unwrap();
    let keeper = w.create(m.variant).unwrap();
    let sig = w.create(m.type_id).unwrap();
    let types: Vec<Type> = (0..40).map(|_| new_type(&m, &mut w, file)).collect();
    for t in &types {
        m.type_superclass.put(&mut w, t.0, Some(sig)).unwrap();
    }
    assert_eq!(m.signature_users.size(&w, sig.0).unwrap(), 40);
    assert_indices_consistent(&m, &w, sig);

    for t in types.iter().step_by(3) {
        m.type_superclass.put(&mut w, t.0, Some(keeper)).unwrap();
        assert_indices_consistent(&m, &w, sig);
        assert_indices_consistent(&m, &w, keeper);
    }
    assert_eq!(m.signature_users.size(&w, sig.0).unwrap(), 26);
    assert_eq!(m.signature_users.size(&w, keeper.0).unwrap(), 14);
}

#[test]
fn test_owner_reassignment_and_clearing() {
    let (m, schema) = model();
    let nd = open(schema);
    let mut w = nd.acquire_write_lock().unwrap();

    let first = w.create(m.file).unwrap();
    let second = w.create(m.file).unwrap();
    let t = new_type(&m, &mut w, first);

    m.type_file.put(&mut w, t.0, Some(second)).unwrap();
    assert!(!w.is_pending_deletion(t.0));
    assert!(m.file_types.is_empty(&w, first.0).unwrap());
    assert_eq!(m.file_types.as_list(&w, second.0).unwrap(), vec![t]);

    m.type_file.put(&mut w, t.0, None).unwrap();
    assert!(w.is_pending_deletion(t.0));
    assert_eq!(w.process_deletions().unwrap(), 1);
    assert_eq!(w.memory_stats().pool(POOL_FIRST_NODE_TYPE + m.type_def.id()).live_allocations, 0);
}

#[test]
fn test_cascading_delete_frees_every_byte() {
    let (m, schema) = model();
    let nd = open(schema);
    let mut w = nd.acquire_write_lock().unwrap();
    assert_eq!(w.memory_stats().live_bytes(), 0);

    let file = w.create(m.file).unwrap();
    m.file_name.put(&mut w, file.0, "java/lang/Object.class").unwrap();
    let signatures = [
        w.create(m.type_id).unwrap(),
        w.create(m.variant).unwrap(),
        w.create(m.type_id).unwrap(),
    ];
    for (i, sig) in signatures.iter().enumerate() {
        m.signature_name.put(&mut w, sig.0, &format!("Ljava/lang/Sig{i};")).unwrap();
    }
    for i in 0..300 {
        let t = new_type(&m, &mut w, file);
        m.type_modifiers.put(&mut w, t.0, i).unwrap();
        m.type_superclass.put(&mut w, t.0, Some(signatures[i as usize % 3])).unwrap();
    }
    assert!(w.memory_stats().pool(POOL_GROWABLE_ARRAY).live_allocations > 0);

    w.delete(file.0).unwrap();
    assert_eq!(w.process_deletions().unwrap(), 1 + 300 + 3);

    let stats = w.memory_stats();
    assert_eq!(stats.live_bytes(), 0, "{stats:?}");
    assert_eq!(stats.live_allocations(), 0);
    let report = IntegrityChecker::new(&w).verify_allocator().unwrap();
    assert!(report.is_healthy(), "{:?}", report.errors);
}

#[test]
fn test_deleting_target_nulls_forward_pointers() {
    let (m, schema) = model();
    let nd = open(schema);
    let mut w = nd.acquire_write_lock().unwrap();

    let file = w.create(m.file).unwrap();
    let sig = w.create(m.type_id).unwrap();
    let types: Vec<Type> = (0..5).map(|_| new_type(&m, &mut w, file)).collect();
    for t in &types {
        m.type_superclass.put(&mut w, t.0, Some(sig)).unwrap();
    }

    w.delete(sig.0).unwrap();
    assert_eq!(w.process_deletions().unwrap(), 1);
    for t in &types {
        assert_eq!(m.type_superclass.get(&w, t.0).unwrap(), None);
    }
    assert_eq!(m.file_types.size(&w, file.0).unwrap(), 5);
}

#[test]
fn test_ref_count_shared_across_subtypes() {
    let (m, schema) = model();
    let nd = open(schema);
    let mut w = nd.acquire_write_lock().unwrap();

    let file = w.create(m.file).unwrap();
    let id_sig = w.create(m.type_id).unwrap();
    let variant_sig = w.create(m.variant).unwrap();
    let t1 = new_type(&m, &mut w, file);
    let t2 = new_type(&m, &mut w, file);
    m.type_superclass.put(&mut w, t1.0, Some(id_sig)).unwrap();
    m.type_superclass.put(&mut w, t2.0, Some(id_sig)).unwrap();
    m.type_superclass.put(&mut w, t1.0, Some(variant_sig)).unwrap();
    assert!(!w.is_pending_deletion(id_sig.0));

    // The last reference goes through a field typed as the base struct.
    m.type_superclass.put(&mut w, t2.0, Some(variant_sig)).unwrap();
    assert!(w.is_pending_deletion(id_sig.0));
    assert!(nd.is_ready_for_deletion(id_sig.0).unwrap());
    assert!(!nd.is_ready_for_deletion(variant_sig.0).unwrap());

    assert_eq!(w.process_deletions().unwrap(), 1);
    let stats = w.memory_stats();
    assert_eq!(stats.pool(POOL_FIRST_NODE_TYPE + m.type_id.id()).live_allocations, 0);
    assert_eq!(stats.pool(POOL_FIRST_NODE_TYPE + m.variant.id()).live_allocations, 1);
}

#[test]
fn test_random_reassignment_matches_model() {
    let (m, schema) = model();
    let nd = open(schema);
    let mut w = nd.acquire_write_lock().unwrap();
    let mut rng = StdRng::seed_from_u64(0xA551);

    let file = w.create(m.file).unwrap();
    // Each signature keeps one permanent user so ref counting never deletes it.
    let signatures: Vec<Signature> = (0..6)
        .map(|i| {
            let def = if i % 2 == 0 { m.type_id } else { m.variant };
            let sig = w.create(def).unwrap();
            let anchor = new_type(&m, &mut w, file);
            m.type_superclass.put(&mut w, anchor.0, Some(sig)).unwrap();
            sig
        })
        .collect();
    let types: Vec<Type> = (0..60).map(|_| new_type(&m, &mut w, file)).collect();
    let mut expected: HashMap<Type, Option<Signature>> = types.iter().map(|&t| (t, None)).collect();

    for _ in 0..2_000 {
        let t = types[rng.gen_range(0..types.len())];
        let target = if rng.gen_range(0..5) == 0 {
            None
        } else {
            Some(signatures[rng.gen_range(0..signatures.len())])
        };
        m.type_superclass.put(&mut w, t.0, target).unwrap();
        expected.insert(t, target);
    }

    for sig in &signatures {
        assert_indices_consistent(&m, &w, *sig);
        let expected_users = expected.values().filter(|s| **s == Some(*sig)).count();
        assert_eq!(m.signature_users.size(&w, sig.0).unwrap(), expected_users + 1);
    }
    for (t, sig) in &expected {
        assert_eq!(m.type_superclass.get(&w, t.0).unwrap(), *sig);
    }
    assert_eq!(w.pending_deletions(), 0);
}
