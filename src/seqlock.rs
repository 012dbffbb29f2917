//! Sequence-locked snapshot cells for multi-word values shared between tasks
//!
//! Writers never wait on readers and readers never observe a partially written value.
use crate::{InertialSample, PidGains};
use nalgebra::{Quaternion, Vector3};
use std::hint::spin_loop;
use std::sync::atomic::{fence, AtomicU32, Ordering};

/// Values that can be flattened into `N` `f32` words
pub trait Packed<const N: usize>: Sized {
    fn pack(&self) -> [f32; N];
    fn unpack(words: &[f32; N]) -> Self;
}

impl Packed<4> for Quaternion<f32> {
    fn pack(&self) -> [f32; 4] {
        [self.w, self.i, self.j, self.k]
    }

    fn unpack(words: &[f32; 4]) -> Self {
        Quaternion::new(words[0], words[1], words[2], words[3])
    }
}

impl Packed<4> for PidGains {
    fn pack(&self) -> [f32; 4] {
        [self.p, self.i, self.d, self.n]
    }

    fn unpack(words: &[f32; 4]) -> Self {
        PidGains {
            p: words[0],
            i: words[1],
            d: words[2],
            n: words[3],
        }
    }
}

impl Packed<9> for InertialSample {
    fn pack(&self) -> [f32; 9] {
        let mut words = [0.0; 9];
        words[0..3].copy_from_slice(self.accel.as_slice());
        words[3..6].copy_from_slice(self.gyro.as_slice());
        words[6..9].copy_from_slice(self.mag.as_slice());
        words
    }

    fn unpack(words: &[f32; 9]) -> Self {
        InertialSample {
            accel: Vector3::from_column_slice(&words[0..3]),
            gyro: Vector3::from_column_slice(&words[3..6]),
            mag: Vector3::from_column_slice(&words[6..9]),
        }
    }
}

impl<const N: usize> Packed<N> for [f32; N] {
    fn pack(&self) -> [f32; N] {
        *self
    }

    fn unpack(words: &[f32; N]) -> Self {
        *words
    }
}

/// Lock-free single-value cell with consistent snapshot reads
///
/// The sequence counter is odd while a write is in progress. Concurrent writers
/// serialise on the counter; readers retry until they see the same even counter
/// before and after copying the words.
pub struct SeqCell<T: Packed<N>, const N: usize> {
    sequence: AtomicU32,
    words: [AtomicU32; N],
    _value: std::marker::PhantomData<fn() -> T>,
}

impl<T: Packed<N>, const N: usize> SeqCell<T, N> {
    pub fn new(value: T) -> Self {
        let words = value.pack();
        Self {
            sequence: AtomicU32::new(0),
            words: std::array::from_fn(|i| AtomicU32::new(words[i].to_bits())),
            _value: std::marker::PhantomData,
        }
    }
    /// Publishes a new value
    pub fn store(&self, value: &T) {
        let words = value.pack();
        let mut sequence = self.sequence.load(Ordering::Relaxed);
        loop {
            if sequence % 2 == 1 {
                spin_loop();
                sequence = self.sequence.load(Ordering::Relaxed);
                continue;
            }
            match self.sequence.compare_exchange_weak(
                sequence,
                sequence.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => sequence = current,
            }
        }
        fence(Ordering::Release);
        for (slot, word) in self.words.iter().zip(words) {
            slot.store(word.to_bits(), Ordering::Relaxed);
        }
        self.sequence
            .store(sequence.wrapping_add(2), Ordering::Release);
    }
    /// Returns a consistent copy of the latest value
    pub fn load(&self) -> T {
        loop {
            let before = self.sequence.load(Ordering::Acquire);
            if before % 2 == 1 {
                spin_loop();
                continue;
            }
            let words: [f32; N] =
                std::array::from_fn(|i| f32::from_bits(self.words[i].load(Ordering::Relaxed)));
            fence(Ordering::Acquire);
            if self.sequence.load(Ordering::Relaxed) == before {
                return T::unpack(&words);
            }
            spin_loop();
        }
    }
    /// Number of completed writes
    pub fn version(&self) -> u32 {
        self.sequence.load(Ordering::Acquire) / 2
    }
}

impl<T: Packed<N> + Default, const N: usize> Default for SeqCell<T, N> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub type QuaternionCell = SeqCell<Quaternion<f32>, 4>;
pub type GainsCell = SeqCell<PidGains, 4>;
pub type SampleCell = SeqCell<InertialSample, 9>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn load_returns_last_store() {
        let cell = QuaternionCell::new(Quaternion::identity());
        assert_eq!(cell.load(), Quaternion::identity());
        let q = Quaternion::new(0.5, 0.5, -0.5, 0.5);
        cell.store(&q);
        assert_eq!(cell.load(), q);
        assert_eq!(cell.version(), 1);
    }

    #[test]
    fn sample_words_keep_axis_order() {
        let sample = InertialSample {
            accel: Vector3::new(1.0, 2.0, 3.0),
            gyro: Vector3::new(4.0, 5.0, 6.0),
            mag: Vector3::new(7.0, 8.0, 9.0),
        };
        let cell = SampleCell::new(InertialSample::default());
        cell.store(&sample);
        assert_eq!(cell.load(), sample);
    }

    #[test]
    fn concurrent_readers_never_see_torn_values() {
        let cell = Arc::new(SeqCell::<[f32; 4], 4>::new([0.0; 4]));
        let writer = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                for i in 1..=20_000 {
                    let value = i as f32;
                    cell.store(&[value, value, value, value]);
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for _ in 0..20_000 {
                        let words = cell.load();
                        assert!(words.iter().all(|w| *w == words[0]), "torn read {words:?}");
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(cell.load(), [20_000.0; 4]);
    }

    #[test]
    fn concurrent_writers_serialise() {
        let cell = Arc::new(GainsCell::default());
        let writers: Vec<_> = (0..4)
            .map(|n| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    let value = n as f32;
                    for _ in 0..5_000 {
                        cell.store(&PidGains {
                            p: value,
                            i: value,
                            d: value,
                            n: value,
                        });
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        let gains = cell.load();
        assert!(gains.p == gains.i && gains.i == gains.d && gains.d == gains.n);
        assert_eq!(cell.version(), 20_000);
    }
}
