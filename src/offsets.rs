// offsets.rs — C2: process-wide field offsets and function RVAs.
//
// Deliberately a flat struct of atomics (§9 "Replacing dynamic dispatch" —
// no polymorphic strategy object), following the teacher's own style of
// module-level AtomicUsize globals (ENGINE_TABLE, EXTRA_INFO_BASE, ...) but
// collected into one named, updatable cell instead of scattered statics.
// Readers use relaxed loads; `apply` performs relaxed, field-by-field
// stores — there is no transactional "swap all offsets" semantics (§5).

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Compiled-in defaults. These are build-specific RVAs/offsets — placeholders
/// until a `set_offsets` command supplies the real values for the running
/// client build.
pub struct OffsetRegistry {
    pub singleton_base: AtomicU32,
    pub attack_fn: AtomicU32,
    pub send_attack_fn: AtomicU32,
    pub xtea_encrypt_fn: AtomicU32,

    pub vtable_min_rva: AtomicU32,
    pub vtable_max_rva: AtomicU32,

    pub creature_vtable_off: AtomicU32,
    pub creature_id_off: AtomicU32,
    pub creature_name_off: AtomicU32,
    pub creature_health_off: AtomicU32,
    pub creature_pos_off_npc: AtomicI32,
    pub creature_pos_off_player: AtomicI32,

    pub singleton_attacking_creature_off: AtomicU32,
    pub singleton_sequence_off: AtomicU32,
}

impl OffsetRegistry {
    pub const fn new() -> Self {
        Self {
            singleton_base: AtomicU32::new(0x0048_3A20),
            attack_fn: AtomicU32::new(0x0041_7C10),
            send_attack_fn: AtomicU32::new(0x0041_8B40),
            xtea_encrypt_fn: AtomicU32::new(0x0042_0F90),

            vtable_min_rva: AtomicU32::new(0x0040_0000),
            vtable_max_rva: AtomicU32::new(0x0070_0000),

            creature_vtable_off: AtomicU32::new(0x0000),
            creature_id_off: AtomicU32::new(0x0004),
            creature_name_off: AtomicU32::new(0x0010),
            creature_health_off: AtomicU32::new(0x0038),
            creature_pos_off_npc: AtomicI32::new(0x0044),
            creature_pos_off_player: AtomicI32::new(-0x0060),

            singleton_attacking_creature_off: AtomicU32::new(0x0120),
            singleton_sequence_off: AtomicU32::new(0x0128),
        }
    }

    pub fn apply(&self, update: &SetOffsetsFields) {
        macro_rules! apply_u32 {
            ($field:ident) => {
                if let Some(v) = update.$field {
                    self.$field.store(v, Ordering::Relaxed);
                }
            };
        }
        macro_rules! apply_i32 {
            ($field:ident) => {
                if let Some(v) = update.$field {
                    self.$field.store(v, Ordering::Relaxed);
                }
            };
        }
        apply_u32!(singleton_base);
        apply_u32!(attack_fn);
        apply_u32!(send_attack_fn);
        apply_u32!(xtea_encrypt_fn);
        apply_u32!(vtable_min_rva);
        apply_u32!(vtable_max_rva);
        apply_u32!(creature_vtable_off);
        apply_u32!(creature_id_off);
        apply_u32!(creature_name_off);
        apply_u32!(creature_health_off);
        apply_i32!(creature_pos_off_npc);
        apply_i32!(creature_pos_off_player);
        apply_u32!(singleton_attacking_creature_off);
        apply_u32!(singleton_sequence_off);
    }
}

pub static OFFSETS: OffsetRegistry = OffsetRegistry::new();

/// Partial update payload parsed from a `set_offsets` command line. Every
/// field optional; unknown JSON keys are ignored by serde by default.
#[derive(serde::Deserialize, Default)]
pub struct SetOffsetsFields {
    pub singleton_base: Option<u32>,
    pub attack_fn: Option<u32>,
    pub send_attack_fn: Option<u32>,
    pub xtea_encrypt_fn: Option<u32>,
    pub vtable_min_rva: Option<u32>,
    pub vtable_max_rva: Option<u32>,
    pub creature_vtable_off: Option<u32>,
    pub creature_id_off: Option<u32>,
    pub creature_name_off: Option<u32>,
    pub creature_health_off: Option<u32>,
    pub creature_pos_off_npc: Option<i32>,
    pub creature_pos_off_player: Option<i32>,
    pub singleton_attacking_creature_off: Option<u32>,
    pub singleton_sequence_off: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn partial_update_only_touches_named_fields() {
        let reg = OffsetRegistry::new();
        let before_attack = reg.attack_fn.load(Ordering::Relaxed);

        let update = SetOffsetsFields {
            singleton_base: Some(0xDEAD_0000),
            ..Default::default()
        };
        reg.apply(&update);

        assert_eq!(reg.singleton_base.load(Ordering::Relaxed), 0xDEAD_0000);
        assert_eq!(reg.attack_fn.load(Ordering::Relaxed), before_attack);
    }

    #[test]
    fn unknown_json_keys_are_ignored() {
        let parsed: SetOffsetsFields =
            serde_json::from_str(r#"{"singleton_base": 291, "bogus_field": 7}"#).unwrap();
        assert_eq!(parsed.singleton_base, Some(291));
    }
}
