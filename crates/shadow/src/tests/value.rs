use crate::Shadow;

#[test]
fn copy_preserves_mask() {
    let v = Shadow::with_mask(0xdead_beefu32, 0x00ff_ff00);
    let copy = v;
    assert_eq!(copy.value(), 0xdead_beef);
    assert_eq!(copy.mask(), 0x00ff_ff00);
}

#[test]
fn add_taints_whole_result() {
    let defined = Shadow::initialized(1u32);
    let undefined = Shadow::uninitialized(2u32);

    assert!(defined.add(defined).is_fully_initialized());
    assert!(defined.add(undefined).is_fully_uninitialized());
    assert!(undefined.add(defined).is_fully_uninitialized());

    // A single undefined bit is enough.
    let one_bad_bit = Shadow::with_mask(4u32, !0x10);
    assert!(defined.add(one_bad_bit).is_fully_uninitialized());
}

#[test]
fn xor_of_defined_value_with_itself_is_defined_zero() {
    let x = Shadow::initialized(0x1234_5678u32);
    let r = x ^ x;
    assert_eq!(r.value(), 0);
    assert!(r.is_fully_initialized());
}

#[test]
fn bitwise_masks_intersect() {
    let a = Shadow::with_mask(0xffu32, 0x0f);
    let b = Shadow::with_mask(0xf0u32, 0xff);
    assert_eq!((a & b).mask(), 0x0f);
    assert_eq!((a | b).mask(), 0x0f);
    assert_eq!((a ^ b).mask(), 0x0f);
}

#[test]
fn not_keeps_mask() {
    let a = Shadow::with_mask(0b1010u32, 0b1111);
    let r = !a;
    assert_eq!(r.value(), !0b1010u32);
    assert_eq!(r.mask(), 0b1111);
}

#[test]
fn sub_and_mul_wrap() {
    let a = Shadow::initialized(0u32);
    let b = Shadow::initialized(1u32);
    assert_eq!(a.sub(b).value(), u32::MAX);

    let big = Shadow::initialized(0x8000_0001u32);
    assert_eq!(big.mul(Shadow::initialized(2)).value(), 2);
}

#[test]
fn div_by_zero_is_none() {
    let a = Shadow::initialized(10u32);
    assert!(a.div(Shadow::initialized(0)).is_none());
    assert!(a.rem(Shadow::initialized(0)).is_none());
    assert_eq!(a.div(Shadow::initialized(3)).unwrap().value(), 3);
}

#[test]
fn shl_defines_vacated_bits() {
    let v = Shadow::with_mask(0b1u32, 0b1);
    let r = v.shl(Shadow::initialized(4));
    assert_eq!(r.value(), 0b10000);
    // Low four bits are freshly shifted-in zeros, bit 4 keeps its state.
    assert_eq!(r.mask() & 0b11111, 0b11111);
}

#[test]
fn shift_by_tainted_count_taints_everything() {
    let v = Shadow::initialized(0xffu32);
    let r = v.shl(Shadow::uninitialized(1));
    assert!(r.is_fully_uninitialized());
}

#[test]
fn sar_replicates_sign_definedness() {
    // Sign bit defined: incoming bits defined.
    let v = Shadow::with_mask(0x8000_0000u32, 0x8000_0000);
    let r = v.sar(Shadow::initialized(4));
    assert_eq!(r.value(), 0xf800_0000);
    assert_eq!(r.mask() & 0xf800_0000, 0xf800_0000);

    // Sign bit undefined: incoming bits undefined.
    let v = Shadow::with_mask(0x8000_0000u32, 0x7fff_ffff);
    let r = v.sar(Shadow::initialized(4));
    assert_eq!(r.mask() & 0xf000_0000, 0);
}

#[test]
fn zext_tracks_top_source_bit() {
    let defined_top = Shadow::with_mask(0x80u8, 0x80);
    assert_eq!(defined_top.zext32().mask() & 0xffff_ff00, 0xffff_ff00);

    let undefined_top = Shadow::with_mask(0x80u8, 0x7f);
    assert_eq!(undefined_top.zext32().mask() & 0xffff_ff00, 0);
    assert_eq!(undefined_top.zext32().value(), 0x80);
}

#[test]
fn sext_replicates_value_and_mask() {
    let v = Shadow::initialized(0x80u8);
    let r = v.sext32();
    assert_eq!(r.value(), 0xffff_ff80);
    assert!(r.is_fully_initialized());

    let v = Shadow::initialized(0x7fu8);
    assert_eq!(v.sext32().value(), 0x7f);
}

#[test]
fn le_parts_round_trip() {
    let v = Shadow::with_mask(0x1122_3344u32, 0xff00_ff00);
    let parts = v.to_le_parts();
    assert_eq!(parts[0], (0x44, 0x00));
    assert_eq!(parts[3], (0x11, 0xff));
    assert_eq!(Shadow::<u32>::from_le_parts(parts), v);
}

#[test]
fn partial_register_writes() {
    let eax = Shadow::initialized(0xaabb_ccddu32);
    let updated = eax.with_low8(Shadow::uninitialized(0x11));
    assert_eq!(updated.value(), 0xaabb_cc11);
    assert_eq!(updated.mask(), 0xffff_ff00);
    assert_eq!(updated.byte1().value(), 0xcc);

    let updated = updated.with_byte1(Shadow::initialized(0x22));
    assert_eq!(updated.value(), 0xaabb_2211);
    assert_eq!(updated.mask(), 0xffff_ff00 | 0xff00);
}
