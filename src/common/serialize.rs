//
// Copyright 2024 the sfu-core authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Serialization of composed values to `Vec<u8>`, used to build RTCP
//! packet bodies without intermediate allocations per field.

pub trait Writer {
    fn written_len(&self) -> usize;
    fn write(&self, out: &mut dyn Writable);
    fn to_vec(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(self.written_len());
        self.write(&mut vec);
        vec
    }
}

// Like std::io::Write but can't fail or do partial writes.
pub trait Writable {
    fn write(&mut self, input: &[u8]);
}

impl Writable for Vec<u8> {
    fn write(&mut self, input: &[u8]) {
        self.extend_from_slice(input);
    }
}

pub struct Empty {}

impl Writer for Empty {
    fn written_len(&self) -> usize {
        0
    }
    fn write(&self, _out: &mut dyn Writable) {}
}

impl<T: Writer> Writer for Option<T> {
    fn written_len(&self) -> usize {
        match self {
            None => 0,
            Some(writer) => writer.written_len(),
        }
    }
    fn write(&self, out: &mut dyn Writable) {
        if let Some(writer) = self {
            writer.write(out)
        }
    }
}

// u8 is not implemented directly to avoid a conflict between [u8] and [T: Writer].
impl<const N: usize> Writer for [u8; N] {
    fn written_len(&self) -> usize {
        self.len()
    }
    fn write(&self, out: &mut dyn Writable) {
        out.write(&self[..]);
    }
}

impl Writer for [u8] {
    fn written_len(&self) -> usize {
        self.len()
    }
    fn write(&self, out: &mut dyn Writable) {
        out.write(self);
    }
}

impl Writer for Vec<u8> {
    fn written_len(&self) -> usize {
        self.len()
    }
    fn write(&self, out: &mut dyn Writable) {
        out.write(&self[..]);
    }
}

impl Writer for u16 {
    fn written_len(&self) -> usize {
        2
    }
    fn write(&self, out: &mut dyn Writable) {
        self.to_be_bytes().write(out)
    }
}

impl Writer for u32 {
    fn written_len(&self) -> usize {
        4
    }
    fn write(&self, out: &mut dyn Writable) {
        self.to_be_bytes().write(out)
    }
}

impl Writer for u64 {
    fn written_len(&self) -> usize {
        8
    }
    fn write(&self, out: &mut dyn Writable) {
        self.to_be_bytes().write(out)
    }
}

macro_rules! impl_writer_tuple {
    ($($name:ident)+) => (
    impl<$($name: Writer),+> Writer for ($($name,)+) {
        #[allow(non_snake_case)]
        fn written_len(&self) -> usize {
            let ($(ref $name,)+) = *self;
            let mut len = 0;
            $(len += $name.written_len();)+
            len
        }
        #[allow(non_snake_case)]
        fn write(&self, out: &mut dyn Writable) {
            let ($(ref $name,)+) = *self;
            $($name.write(out);)+
        }
    });
}

impl_writer_tuple! { A }
impl_writer_tuple! { A B }
impl_writer_tuple! { A B C }
impl_writer_tuple! { A B C D }
impl_writer_tuple! { A B C D E }
impl_writer_tuple! { A B C D E F }

impl<T: Writer> Writer for [T] {
    fn written_len(&self) -> usize {
        self.iter().map(|writable| writable.written_len()).sum()
    }
    fn write(&self, out: &mut dyn Writable) {
        for writable in self {
            writable.write(out);
        }
    }
}

impl<T: Writer> Writer for Vec<T> {
    fn written_len(&self) -> usize {
        self.iter().map(|writable| writable.written_len()).sum()
    }
    fn write(&self, out: &mut dyn Writable) {
        for writable in self {
            writable.write(out);
        }
    }
}

// Necessary for composition with other impls (such as tuples).
impl<T: Writer + ?Sized> Writer for &T {
    fn written_len(&self) -> usize {
        T::written_len(self)
    }

    fn write(&self, out: &mut dyn Writable) {
        T::write(self, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars() {
        assert_eq!("0064", hex::encode(100u16.to_vec()));
        assert_eq!("00002778", hex::encode(10104u32.to_vec()));
        assert_eq!(8, 1u64.written_len());
        assert_eq!("0000000000000001", hex::encode(1u64.to_vec()));
    }

    #[test]
    fn tuples_and_vecs() {
        let tuple = ([255u8], 100u16, 2_123_000_101u32);
        assert_eq!("ff00647e8a6925", hex::encode(tuple.to_vec()));

        let vec = vec![1u32, 1 << 31];
        assert_eq!("0000000180000000", hex::encode(vec.to_vec()));

        let nested = (1u16, vec![1u8, 1 << 7]);
        assert_eq!("00010180", hex::encode(nested.to_vec()));
    }

    #[test]
    fn empty_and_option() {
        assert_eq!(0, (Empty {}).written_len());
        assert_eq!(0, None::<u16>.written_len());
        assert_eq!("0064", hex::encode(Some(100u16).to_vec()));
    }
}
