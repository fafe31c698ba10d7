use bevy::core_pipeline::tonemapping::Tonemapping;
use bevy::prelude::*;
use studio_lighting::{
    DeferredCamera, DeferredConfig, DeferredLightingPlugin, DeferredPointLight, DeferredRenderable,
    LightStore,
};

/// Number of colored lights circling the scene.
const ORBITING_LIGHTS: usize = 12;

fn main() {
    let mut app = App::new();
    app.add_plugins(DefaultPlugins);

    // Optional JSON config path as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => match DeferredConfig::load(&path) {
            Ok(config) => {
                info!("Loaded deferred lighting config from {}", path);
                config
            }
            Err(err) => {
                warn!("Ignoring config {}: {}", path, err);
                DeferredConfig::default()
            }
        },
        None => DeferredConfig::default(),
    };

    app.add_plugins(DeferredLightingPlugin::new(config))
        .insert_resource(ClearColor(Color::BLACK))
        .add_systems(Startup, setup)
        .add_systems(Update, orbit_lights)
        .run();
}

#[derive(Component)]
struct Orbit {
    radius: f32,
    height: f32,
    speed: f32,
    phase: f32,
}

fn setup(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut lights: ResMut<LightStore>,
) {
    lights.set_ambient(Vec3::new(0.6, 0.65, 0.8), 0.05);

    // Deferred views bypass Bevy's own tonemapping and MSAA
    commands.spawn((
        Camera3d::default(),
        Tonemapping::None,
        Msaa::Off,
        DeferredCamera {
            near: 0.1,
            far: 60.0,
        },
        Transform::from_xyz(0.0, 9.0, 16.0).looking_at(Vec3::new(0.0, 1.0, 0.0), Vec3::Y),
    ));

    // Floor
    commands.spawn((
        Mesh3d(meshes.add(Cuboid::new(30.0, 0.2, 30.0))),
        DeferredRenderable {
            albedo: Color::srgb(0.7, 0.7, 0.7),
            roughness: 0.8,
            ..default()
        },
        Transform::from_xyz(0.0, -0.1, 0.0),
    ));

    // Ring of cubes with varying materials
    let cube = meshes.add(Cuboid::new(1.0, 1.0, 1.0));
    for i in 0..10 {
        let angle = i as f32 / 10.0 * std::f32::consts::TAU;
        let t = i as f32 / 9.0;
        commands.spawn((
            Mesh3d(cube.clone()),
            DeferredRenderable {
                albedo: Color::hsl(angle.to_degrees(), 0.6, 0.6),
                roughness: 0.2 + 0.7 * t,
                metallic: if i % 3 == 0 { 1.0 } else { 0.0 },
                ambient_occlusion: 1.0,
            },
            Transform::from_xyz(angle.cos() * 5.0, 0.5 + t * 1.5, angle.sin() * 5.0)
                .with_scale(Vec3::splat(1.0 + t)),
        ));
    }

    // Central pillar casting shadows from the key light
    commands.spawn((
        Mesh3d(meshes.add(Cylinder::new(0.6, 4.0))),
        DeferredRenderable::default(),
        Transform::from_xyz(0.0, 2.0, 0.0),
    ));

    // Key light above the pillar
    commands.spawn((
        DeferredPointLight::new(Color::srgb(1.0, 0.95, 0.85), 40.0, 25.0),
        Transform::from_xyz(2.0, 6.0, 2.0),
    ));

    for i in 0..ORBITING_LIGHTS {
        let phase = i as f32 / ORBITING_LIGHTS as f32 * std::f32::consts::TAU;
        commands.spawn((
            DeferredPointLight::new(Color::hsl(phase.to_degrees(), 0.9, 0.5), 6.0, 6.0),
            Transform::default(),
            Orbit {
                radius: 8.0 + (i % 3) as f32,
                height: 0.8 + (i % 4) as f32 * 0.4,
                speed: 0.3 + (i % 5) as f32 * 0.1,
                phase,
            },
        ));
    }
}

fn orbit_lights(time: Res<Time>, mut lights: Query<(&Orbit, &mut Transform)>) {
    let t = time.elapsed_secs();
    for (orbit, mut transform) in &mut lights {
        let angle = orbit.phase + t * orbit.speed;
        transform.translation = Vec3::new(
            angle.cos() * orbit.radius,
            orbit.height,
            angle.sin() * orbit.radius,
        );
    }
}
