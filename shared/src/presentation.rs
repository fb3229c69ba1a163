//! The shell-side map.
//!
//! [`MapPresentation`] is what a concrete map widget implements; [`apply`]
//! turns the core's [`MapOperation`]s into calls on it. [`HeadlessMap`] keeps
//! everything in memory and is what tests and the headless shell drive.

use tracing::warn;

use crate::capabilities::{LayerHandle, LayerStyle, MapOperation, MarkerSpec};
use crate::dataset::FeatureRef;
use crate::event::Event;
use crate::model::{Position, SessionId};

/// Interaction reported back by the map.
#[derive(Debug, Clone, PartialEq)]
pub enum MapEvent {
    FeatureClicked(FeatureRef),
    ProxyDragged(Position),
}

impl From<MapEvent> for Event {
    fn from(event: MapEvent) -> Self {
        match event {
            MapEvent::FeatureClicked(feature) => Event::FeatureClicked {
                dataset: feature.dataset,
                index: feature.index,
            },
            MapEvent::ProxyDragged(position) => Event::ProxyMoved { position },
        }
    }
}

pub trait MapPresentation {
    fn render_dataset(
        &mut self,
        layer: &LayerHandle,
        name: &str,
        style: &LayerStyle,
        markers: &[MarkerSpec],
    );
    fn remove_dataset(&mut self, layer: &LayerHandle);
    fn set_marker_visibility(&mut self, feature: &FeatureRef, visible: bool);
    fn move_marker(&mut self, feature: &FeatureRef, position: Position);
    fn place_draggable_marker(&mut self, session: &SessionId, position: Position);
    fn remove_draggable_marker(&mut self, session: &SessionId);
    /// Where the draggable marker currently sits, if one is placed.
    fn proxy_position(&self) -> Option<Position>;
    /// Drains interactions since the last call.
    fn poll_events(&mut self) -> Vec<MapEvent>;
}

pub fn apply<M: MapPresentation + ?Sized>(map: &mut M, operation: &MapOperation) {
    match operation {
        MapOperation::RenderDataset {
            layer,
            name,
            style,
            markers,
        } => map.render_dataset(layer, name, style, markers),
        MapOperation::RemoveDataset { layer } => map.remove_dataset(layer),
        MapOperation::SetMarkerVisibility { feature, visible } => {
            map.set_marker_visibility(feature, *visible);
        }
        MapOperation::MoveMarker { feature, position } => map.move_marker(feature, *position),
        MapOperation::PlaceDraggableMarker { session, position } => {
            map.place_draggable_marker(session, *position);
        }
        MapOperation::RemoveDraggableMarker { session } => map.remove_draggable_marker(session),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMarker {
    pub spec: MarkerSpec,
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedLayer {
    pub handle: LayerHandle,
    pub name: String,
    pub style: LayerStyle,
    pub markers: Vec<RenderedMarker>,
}

#[derive(Debug, Default)]
pub struct HeadlessMap {
    layers: Vec<RenderedLayer>,
    proxy: Option<(SessionId, Position)>,
    pending: Vec<MapEvent>,
    history: Vec<MapOperation>,
}

impl HeadlessMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layers(&self) -> &[RenderedLayer] {
        &self.layers
    }

    pub fn marker(&self, feature: &FeatureRef) -> Option<&RenderedMarker> {
        self.layers
            .iter()
            .flat_map(|l| &l.markers)
            .find(|m| &m.spec.feature == feature)
    }

    pub fn proxy(&self) -> Option<&(SessionId, Position)> {
        self.proxy.as_ref()
    }

    /// Every operation applied so far, oldest first.
    pub fn history(&self) -> &[MapOperation] {
        &self.history
    }

    /// Simulates a click. Hidden or unknown markers do not react.
    pub fn click(&mut self, feature: &FeatureRef) -> bool {
        let clickable = self.marker(feature).is_some_and(|m| m.visible);
        if clickable {
            self.pending.push(MapEvent::FeatureClicked(feature.clone()));
        }
        clickable
    }

    /// Simulates dragging the proxy. Without a proxy nothing happens.
    pub fn drag_proxy(&mut self, position: Position) -> bool {
        match self.proxy.as_mut() {
            Some((_, current)) => {
                *current = position;
                self.pending.push(MapEvent::ProxyDragged(position));
                true
            }
            None => false,
        }
    }

    fn marker_mut(&mut self, feature: &FeatureRef) -> Option<&mut RenderedMarker> {
        self.layers
            .iter_mut()
            .flat_map(|l| &mut l.markers)
            .find(|m| &m.spec.feature == feature)
    }

    fn record(&mut self, operation: MapOperation) {
        self.history.push(operation);
    }
}

impl MapPresentation for HeadlessMap {
    fn render_dataset(
        &mut self,
        layer: &LayerHandle,
        name: &str,
        style: &LayerStyle,
        markers: &[MarkerSpec],
    ) {
        self.record(MapOperation::RenderDataset {
            layer: layer.clone(),
            name: name.to_string(),
            style: style.clone(),
            markers: markers.to_vec(),
        });
        self.layers.retain(|l| &l.handle != layer);
        self.layers.push(RenderedLayer {
            handle: layer.clone(),
            name: name.to_string(),
            style: style.clone(),
            markers: markers
                .iter()
                .map(|spec| RenderedMarker {
                    spec: spec.clone(),
                    visible: true,
                })
                .collect(),
        });
    }

    fn remove_dataset(&mut self, layer: &LayerHandle) {
        self.record(MapOperation::RemoveDataset {
            layer: layer.clone(),
        });
        self.layers.retain(|l| &l.handle != layer);
    }

    fn set_marker_visibility(&mut self, feature: &FeatureRef, visible: bool) {
        self.record(MapOperation::SetMarkerVisibility {
            feature: feature.clone(),
            visible,
        });
        match self.marker_mut(feature) {
            Some(marker) => marker.visible = visible,
            None => warn!(dataset = %feature.dataset, index = feature.index, "no marker to toggle"),
        }
    }

    fn move_marker(&mut self, feature: &FeatureRef, position: Position) {
        self.record(MapOperation::MoveMarker {
            feature: feature.clone(),
            position,
        });
        if let Some(marker) = self.marker_mut(feature) {
            marker.spec.position = position;
        }
    }

    fn place_draggable_marker(&mut self, session: &SessionId, position: Position) {
        self.record(MapOperation::PlaceDraggableMarker {
            session: session.clone(),
            position,
        });
        if let Some((previous, _)) = &self.proxy {
            warn!(%previous, "draggable marker replaced without removal");
        }
        self.proxy = Some((session.clone(), position));
    }

    fn remove_draggable_marker(&mut self, session: &SessionId) {
        self.record(MapOperation::RemoveDraggableMarker {
            session: session.clone(),
        });
        if matches!(&self.proxy, Some((current, _)) if current == session) {
            self.proxy = None;
        }
    }

    fn proxy_position(&self) -> Option<Position> {
        self.proxy.as_ref().map(|(_, position)| *position)
    }

    fn poll_events(&mut self) -> Vec<MapEvent> {
        std::mem::take(&mut self.pending)
    }
}
