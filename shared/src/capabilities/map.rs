use crux_core::capability::{CapabilityContext, Operation};
use crux_core::macros::Capability;
use serde::{Deserialize, Serialize};

use crate::dataset::{Dataset, FeatureRef};
use crate::model::{DatasetId, Position, SessionId};

pub const MARKER_RADIUS: u32 = 7;
pub const MARKER_FILL_OPACITY: f32 = 0.8;

/// Identifies one rendered layer. The generation distinguishes layers of
/// successive loads of the same file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerHandle {
    pub dataset: DatasetId,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerStyle {
    pub color: String,
    pub radius: u32,
    pub fill_opacity: f32,
}

impl LayerStyle {
    pub fn circle(color: impl Into<String>) -> Self {
        Self {
            color: color.into(),
            radius: MARKER_RADIUS,
            fill_opacity: MARKER_FILL_OPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerSpec {
    pub feature: FeatureRef,
    pub position: Position,
    pub label: Option<String>,
}

/// Map mutations requested by the core. None of them produce a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MapOperation {
    RenderDataset {
        layer: LayerHandle,
        name: String,
        style: LayerStyle,
        markers: Vec<MarkerSpec>,
    },
    RemoveDataset {
        layer: LayerHandle,
    },
    SetMarkerVisibility {
        feature: FeatureRef,
        visible: bool,
    },
    MoveMarker {
        feature: FeatureRef,
        position: Position,
    },
    PlaceDraggableMarker {
        session: SessionId,
        position: Position,
    },
    RemoveDraggableMarker {
        session: SessionId,
    },
}

impl Operation for MapOperation {
    type Output = ();
}

impl MapOperation {
    /// One marker per point feature; features without point geometry are skipped.
    pub fn render(layer: LayerHandle, dataset: &Dataset, label_keys: &[String]) -> Self {
        let markers = dataset
            .features()
            .iter()
            .enumerate()
            .filter_map(|(index, feature)| {
                let position = crate::dataset::point_position(feature)?;
                Some(MarkerSpec {
                    feature: FeatureRef {
                        dataset: dataset.id.clone(),
                        index,
                    },
                    position,
                    label: crate::session::feature_label(feature, label_keys),
                })
            })
            .collect();

        MapOperation::RenderDataset {
            layer,
            name: dataset.name.clone(),
            style: LayerStyle::circle(dataset.color),
            markers,
        }
    }
}

#[derive(Capability)]
pub struct Map<Ev> {
    context: CapabilityContext<MapOperation, Ev>,
}

impl<Ev> Map<Ev> {
    pub fn new(context: CapabilityContext<MapOperation, Ev>) -> Self {
        Self { context }
    }
}

impl<Ev> Map<Ev>
where
    Ev: Send + 'static,
{
    pub fn render_dataset(&self, operation: MapOperation) {
        self.notify(operation);
    }

    pub fn remove_dataset(&self, layer: LayerHandle) {
        self.notify(MapOperation::RemoveDataset { layer });
    }

    pub fn set_marker_visibility(&self, feature: FeatureRef, visible: bool) {
        self.notify(MapOperation::SetMarkerVisibility { feature, visible });
    }

    pub fn move_marker(&self, feature: FeatureRef, position: Position) {
        self.notify(MapOperation::MoveMarker { feature, position });
    }

    pub fn place_draggable_marker(&self, session: SessionId, position: Position) {
        self.notify(MapOperation::PlaceDraggableMarker { session, position });
    }

    pub fn remove_draggable_marker(&self, session: SessionId) {
        self.notify(MapOperation::RemoveDraggableMarker { session });
    }

    fn notify(&self, operation: MapOperation) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context.notify_shell(operation).await;
        });
    }
}
