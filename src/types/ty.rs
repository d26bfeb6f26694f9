//! Type operations: constructors for every type variant, byte sizes,
//! range and limit queries, and value/type matching.

use num::BigInt;

use crate::types::cell::{CellId, CellPool, Kind, TypeCell, TypeVariant};
use crate::types::ir::Op;

/// Address size of the target platform in bytes.
#[must_use] pub fn adr_size() -> u32 { 2 }

/// The number of bytes needed to store an integer (1, 2, 3 or 4).
#[must_use] pub fn int_byte_size(n: &BigInt) -> u32 {
  let m = n.magnitude();
  if m <= &255u32.into() {
    1
  } else if m <= &65_535u32.into() {
    2
  } else if m <= &0xff_ffffu32.into() {
    3
  } else {
    4
  }
}

impl CellPool {
  /// Allocate a bare type cell of a variant.
  pub fn type_alloc(&mut self, variant: TypeVariant) -> CellId {
    self.alloc(Kind::Type(Box::new(TypeCell { variant, ..TypeCell::default() })))
  }

  /// An integer type with the given inclusive range.
  pub fn int_type(&mut self, min: impl Into<BigInt>, max: impl Into<BigInt>) -> CellId {
    let (min, max) = (min.into(), max.into());
    assert!(min <= max, "integer type range is inverted");
    self.alloc(Kind::Type(Box::new(TypeCell {
      variant: TypeVariant::Int,
      range: Some((min, max)),
      ..TypeCell::default()
    })))
  }

  /// A type-of-type, optionally restricted to a base.
  pub fn type_type(&mut self, restriction: Option<CellId>) -> CellId {
    match restriction {
      None => self.builtins.t_type,
      Some(base) => {
        let ty = self.type_alloc(TypeVariant::Type);
        self.type_cell_mut(ty).l = Some(base);
        ty
      }
    }
  }

  /// An `adr of <element>` type. Without an element, the pointee is the
  /// whole of platform memory (a byte).
  pub fn adr_type(&mut self, element: Option<CellId>) -> CellId {
    let element = element.unwrap_or(self.builtins.t_byte);
    let ty = self.type_alloc(TypeVariant::Adr);
    self.type_cell_mut(ty).l = Some(element);
    ty
  }

  /// A tuple type of two parts.
  pub fn tuple_type(&mut self, left: CellId, right: CellId) -> CellId {
    let ty = self.type_alloc(TypeVariant::Tuple);
    let t = self.type_cell_mut(ty);
    t.l = Some(left);
    t.r = Some(right);
    ty
  }

  /// An array type. The element stride starts at the element size;
  /// a caller-set `step` of 0 falls back to it as well.
  pub fn array_type(&mut self, index: CellId, element: CellId) -> CellId {
    let step = self.type_size(element);
    let ty = self.type_alloc(TypeVariant::Array);
    let t = self.type_cell_mut(ty);
    t.l = Some(index);
    t.r = Some(element);
    t.step = step;
    ty
  }

  /// Clone a type cell.
  pub fn type_copy(&mut self, base: CellId) -> CellId {
    self.copy_cell(base)
  }

  /// Derive a new type from a base: a copy whose back-pointer references
  /// the base, so named integer types share structure but widen locally.
  pub fn derive_type(&mut self, base: CellId) -> CellId {
    let ty = self.type_copy(base);
    self[ty].ty = Some(base);
    ty
  }

  /// The payload of a type cell. Panics when the cell is not a type;
  /// callers hold ids they know to be types.
  #[must_use] pub fn type_cell(&self, id: CellId) -> &TypeCell {
    match self[id].kind {
      Kind::Type(ref t) => t,
      ref k => panic!("expected a type cell, found {k:?}"),
    }
  }

  pub fn type_cell_mut(&mut self, id: CellId) -> &mut TypeCell {
    match self[id].kind {
      Kind::Type(ref mut t) => t,
      ref k => panic!("expected a type cell, found {k:?}"),
    }
  }

  /// Whether the cell is an integer type proper.
  #[must_use] pub fn type_is_int(&self, id: CellId) -> bool {
    self.type_variant(id) == TypeVariant::Int
  }

  /// Whether the cell denotes integers in any representation: a constant,
  /// a range, or an integer type cell.
  #[must_use] pub fn type_is_int2(&self, id: CellId) -> bool {
    matches!(self[id].kind, Kind::Int(_) | Kind::Range { .. }) || self.type_is_int(id)
  }

  // ----------------------------------------------------------- range query

  /// The continuous integer range a cell covers, when it has one.
  ///
  /// This is the single range query: constants are degenerate ranges,
  /// variables defer to their type, tuple and variant types take the
  /// union of their parts, sequences take their endpoints.
  #[must_use] pub fn cell_range(&self, id: CellId) -> Option<(BigInt, BigInt)> {
    match self[id].kind {
      Kind::Int(ref n) => Some((n.clone(), n.clone())),
      Kind::Range { lo, hi } => {
        let (min, _) = self.cell_range(lo)?;
        let (_, max) = self.cell_range(hi)?;
        Some((min, max))
      }
      Kind::Var { .. } | Kind::Name { .. } => self.cell_range(self[id].ty?),
      Kind::Type(ref t) => match t.range {
        Some(ref r) => Some(r.clone()),
        None => match t.variant {
          TypeVariant::Tuple | TypeVariant::Variant => {
            let (lmin, lmax) = self.cell_range(t.l?)?;
            let (rmin, rmax) = self.cell_range(t.r?)?;
            Some((lmin.min(rmin), lmax.max(rmax)))
          }
          _ => self.cell_range(t.possible_values?),
        },
      },
      Kind::Tuple { l, r } => {
        let (lmin, lmax) = self.cell_range(l)?;
        let (rmin, rmax) = self.cell_range(r)?;
        Some((lmin.min(rmin), lmax.max(rmax)))
      }
      Kind::Sequence { op, init, limit, .. } => {
        let (imin, imax) = self.cell_range(init)?;
        let (lmin, lmax) = self.cell_range(limit)?;
        if matches!(op, Op::Add | Op::Mul) {
          Some((imin, lmax))
        } else {
          Some((lmin, imax))
        }
      }
      _ => None,
    }
  }

  /// The smallest value a cell can take, as an interned constant.
  pub fn cell_min(&mut self, id: CellId) -> Option<CellId> {
    let (min, _) = self.cell_range(id)?;
    Some(self.int(min))
  }

  /// The largest value a cell can take, as an interned constant.
  pub fn cell_max(&mut self, id: CellId) -> Option<CellId> {
    let (_, max) = self.cell_range(id)?;
    Some(self.int(max))
  }

  // ------------------------------------------------------------- type size

  /// The number of bytes required to represent a type in memory.
  ///
  /// Integer types take the wider of their two bounds; tuples sum their
  /// parts; addresses take the platform address size; arrays multiply
  /// the element size by every dimension's extent; structs sum their
  /// members. Procedures, macros, labels and scopes occupy nothing.
  #[must_use] pub fn type_size(&self, id: CellId) -> u32 {
    match self[id].kind {
      Kind::Tuple { l, r } => self.type_size(l) + self.type_size(r),
      Kind::Type(ref t) => match t.variant {
        TypeVariant::Adr => adr_size(),
        TypeVariant::Array => {
          let elem = t.r.map_or(0, |e| self.type_size(e));
          elem * t.l.map_or(0, |ix| self.dim_count(ix))
        }
        TypeVariant::Struct => {
          self.members(id).filter(|&m| matches!(self[m].kind, Kind::Var { .. }))
            .map(|m| self[m].ty.map_or(0, |ty| self.type_size(ty)))
            .sum()
        }
        TypeVariant::Tuple => {
          t.l.map_or(0, |l| self.type_size(l)) + t.r.map_or(0, |r| self.type_size(r))
        }
        TypeVariant::Proc | TypeVariant::Macro | TypeVariant::Label | TypeVariant::Scope => 0,
        _ => self.range_size(id),
      },
      _ => self.range_size(id),
    }
  }

  fn range_size(&self, id: CellId) -> u32 {
    match self.cell_range(id) {
      Some((min, max)) => int_byte_size(&max).max(int_byte_size(&min)),
      None => 0,
    }
  }

  /// The number of elements a dimension (or tuple of dimensions) spans.
  #[must_use] pub fn dim_count(&self, index: CellId) -> u32 {
    match self[index].kind {
      Kind::Tuple { l, r } => self.dim_count(l) * self.dim_count(r),
      Kind::Type(ref t) if t.variant == TypeVariant::Tuple => {
        let l = t.l.map_or(0, |l| self.dim_count(l));
        let r = t.r.map_or(1, |r| self.dim_count(r));
        l * r
      }
      _ => match self.cell_range(index) {
        Some((min, max)) => u32::try_from(max - min + 1).unwrap_or(0),
        None => 0,
      },
    }
  }

  /// The byte size of a concrete cell: elements and byte accesses are a
  /// single byte, constants take their natural width, everything else
  /// defers to its type.
  #[must_use] pub fn cell_byte_size(&self, id: CellId) -> u32 {
    match self[id].kind {
      Kind::Element { .. } | Kind::Byte { .. } => 1,
      Kind::Int(ref n) => int_byte_size(n),
      Kind::Text(ref s) => u32::try_from(s.len()).expect("text constant too long"),
      _ => self[id].ty.map_or(0, |ty| self.type_size(ty)),
    }
  }

  /// The array dimensions as constant cells `(dim1, dim2)`, as used by
  /// storage-allocation directives. A struct reports its byte size as a
  /// single dimension.
  pub fn array_dims(&mut self, ty: CellId) -> (Option<CellId>, Option<CellId>) {
    match self.type_variant(ty) {
      TypeVariant::Array => {
        let t = self.type_cell(ty);
        let (index, element) = (t.l, t.r);
        let dims = match index.map(|ix| self[ix].kind.clone()) {
          Some(Kind::Tuple { l, r }) => (self.dim_count(l), Some(self.dim_count(r))),
          Some(Kind::Type(t)) if t.variant == TypeVariant::Tuple => {
            let d1 = t.l.map_or(0, |l| self.dim_count(l));
            (d1, t.r.map(|r| self.dim_count(r)))
          }
          Some(_) => {
            let d1 = self.dim_count(index.expect("array has an index type"));
            // An array of arrays exposes the inner dimension second.
            let d2 = element.filter(|&e| self.type_variant(e) == TypeVariant::Array).map(|e| {
              self.type_cell(e).l.map_or(0, |ix| self.dim_count(ix))
            });
            (d1, d2)
          }
          None => (0, None),
        };
        let dim1 = Some(self.int(dims.0));
        let dim2 = dims.1.map(|d| self.int(d));
        (dim1, dim2)
      }
      TypeVariant::Struct => {
        let size = self.type_size(ty);
        (Some(self.int(size)), None)
      }
      _ => (None, None),
    }
  }

  /// The element stride of an array type; a recorded step of 0 falls
  /// through to the element size.
  #[must_use] pub fn array_step(&self, ty: CellId) -> u32 {
    let t = self.type_cell(ty);
    if t.step != 0 {
      t.step
    } else {
      t.r.map_or(0, |e| self.type_size(e))
    }
  }

  // --------------------------------------------------------------- matching

  /// Whether a constant value is a member of an explicit value set
  /// (a variant tree of constants and ranges).
  #[must_use] fn set_contains(&self, set: CellId, n: &BigInt) -> bool {
    match self[set].kind {
      Kind::Int(ref v) => v == n,
      Kind::Range { .. } => {
        self.cell_range(set).is_some_and(|(min, max)| min <= *n && *n <= max)
      }
      Kind::Tuple { l, r } => self.set_contains(l, n) || self.set_contains(r, n),
      Kind::Type(ref t) if t.variant == TypeVariant::Variant => {
        t.l.is_some_and(|l| self.set_contains(l, n)) || t.r.is_some_and(|r| self.set_contains(r, n))
      }
      _ => false,
    }
  }

  /// Whether a cell's value lies within a type's range or enumerated
  /// value set. Variables match when their whole type range fits.
  #[must_use] pub fn var_match_type(&self, cell: CellId, ty: CellId) -> bool {
    if let Kind::Type(ref t) = self[ty].kind {
      if let Some(values) = t.possible_values {
        if let Some(n) = self.int_value(cell) {
          return self.set_contains(values, n);
        }
      }
      match t.variant {
        TypeVariant::Int => {}
        TypeVariant::Undefined => return true,
        v => return self.value_variant(cell) == v,
      }
    }
    match (self.cell_range(cell), self.cell_range(ty)) {
      (Some((cmin, cmax)), Some((tmin, tmax))) => tmin <= cmin && cmax <= tmax,
      _ => false,
    }
  }

  /// Assign offsets to the members of a struct type in declaration
  /// order, skipping members that carry an explicit address. Returns the
  /// total size. Idempotent.
  pub fn struct_assign_offsets(&mut self, ty: CellId) -> u32 {
    let mut offset = 0u32;
    let members: Vec<_> = self.members(ty).collect();
    for item in members {
      if let Kind::Var { adr, .. } = self[item].kind {
        if adr.is_none() {
          let at = self.int(offset);
          if let Kind::Var { ref mut adr, .. } = self[item].kind {
            *adr = Some(at);
          }
          offset += self[item].ty.map_or(0, |t| self.type_size(t));
        }
      }
    }
    offset
  }
}
