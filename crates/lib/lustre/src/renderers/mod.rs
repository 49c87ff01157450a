use std::cell::{Ref, RefCell};

use lustre_backend::Image;
use lustre_rg::{self as rg, GetOrCreateTemporal};

pub mod half_res;
pub mod reflection_denoise;
pub mod reflections;
pub mod skinning;
pub mod upscale;

/// G-buffer inputs handed in by the rasterization pass, with lazily
/// extracted half-resolution views shared between the reflection passes.
pub struct GbufferDepth {
    pub normal: rg::Handle<Image>,
    pub specular_roughness: rg::Handle<Image>,
    pub motion_vectors: rg::Handle<Image>,
    pub depth: rg::Handle<Image>,
    half_roughness: RefCell<Option<rg::Handle<Image>>>,
    half_depth: RefCell<Option<rg::Handle<Image>>>,
}

impl GbufferDepth {
    pub fn new(
        normal: rg::Handle<Image>,
        specular_roughness: rg::Handle<Image>,
        motion_vectors: rg::Handle<Image>,
        depth: rg::Handle<Image>,
    ) -> Self {
        Self {
            normal,
            specular_roughness,
            motion_vectors,
            depth,
            half_roughness: Default::default(),
            half_depth: Default::default(),
        }
    }

    pub fn half_roughness(&self, rg: &mut rg::RenderGraph) -> Ref<rg::Handle<Image>> {
        if self.half_roughness.borrow().is_none() {
            *self.half_roughness.borrow_mut() = Some(half_res::extract_half_res_roughness(
                rg,
                &self.specular_roughness,
            ));
        }

        Ref::map(self.half_roughness.borrow(), |res| res.as_ref().unwrap())
    }

    pub fn half_depth(&self, rg: &mut rg::RenderGraph) -> Ref<rg::Handle<Image>> {
        if self.half_depth.borrow().is_none() {
            *self.half_depth.borrow_mut() = Some(half_res::extract_half_res_depth(rg, &self.depth));
        }

        Ref::map(self.half_depth.borrow(), |res| res.as_ref().unwrap())
    }
}

/// Two temporal keys driven by a frame parity: this acquire's output slot is
/// last acquire's history slot, purely by index arithmetic.
pub struct PingPongTemporalResource {
    keys: [rg::TemporalResourceKey; 2],
    parity: FrameParity,
}

impl PingPongTemporalResource {
    pub fn new(name: &str) -> Self {
        Self {
            keys: [
                format!("{}:0", name).as_str().into(),
                format!("{}:1", name).as_str().into(),
            ],
            parity: FrameParity::from_frame_index(0),
        }
    }

    fn key_pair(&self) -> (&rg::TemporalResourceKey, &rg::TemporalResourceKey) {
        (
            &self.keys[self.parity.current],
            &self.keys[self.parity.history()],
        )
    }

    pub fn get_output_and_history(
        &mut self,
        rg: &mut rg::TemporalRenderGraph,
        desc: lustre_backend::ImageDesc,
    ) -> (rg::Handle<Image>, rg::Handle<Image>) {
        let (output_key, history_key) = self.key_pair();

        let output_tex = rg.get_or_create_temporal(output_key.clone(), desc).unwrap();
        let history_tex = rg
            .get_or_create_temporal(history_key.clone(), desc)
            .unwrap();

        self.parity = self.parity.advanced();

        (output_tex, history_tex)
    }
}

/// The single frame-counter-derived index that drives every current/history
/// role swap. All ping-pong pairs key off the same parity so they stay in
/// lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameParity {
    pub current: usize,
}

impl FrameParity {
    pub fn from_frame_index(frame_index: u32) -> Self {
        Self {
            current: (frame_index % 2) as usize,
        }
    }

    pub fn history(self) -> usize {
        (self.current + 1) % 2
    }

    pub fn advanced(self) -> Self {
        Self {
            current: self.history(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_swaps_exactly_once_per_frame() {
        for frame in 0..8u32 {
            let parity = FrameParity::from_frame_index(frame);
            let next = FrameParity::from_frame_index(frame + 1);

            assert_ne!(parity.current, next.current);
            assert_eq!(parity.history(), next.current);
            assert_ne!(parity.current, parity.history());
        }
    }

    #[test]
    fn ping_pong_keys_follow_the_parity() {
        let mut ping_pong = PingPongTemporalResource::new("test");
        let (first_output, first_history) = {
            let (o, h) = ping_pong.key_pair();
            (o.clone(), h.clone())
        };
        assert_ne!(first_output, first_history);

        // An advance swaps roles; a second advance restores them.
        ping_pong.parity = ping_pong.parity.advanced();
        let (output, history) = ping_pong.key_pair();
        assert_eq!(*output, first_history);
        assert_eq!(*history, first_output);

        ping_pong.parity = ping_pong.parity.advanced();
        let (output, _) = ping_pong.key_pair();
        assert_eq!(*output, first_output);
    }
}
